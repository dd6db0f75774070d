use gateward::admin::{AdminApi, PKG_NAME, VERSION};
use gateward::config::Config;
use gateward::dirs::{self, StateDirectories};
use gateward::ratelimit::RateLimiter;
use gateward::redact::Redactor;
use gateward::server::GateServer;
use gateward::supervisor::GatewaySupervisor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gateward=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration from the environment
    let config = Config::from_env();
    config.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    print_startup_banner(&config);

    // Resolve the runtime directories through the fallback chain
    let resolved = StateDirectories::resolve(&config);
    info!(
        state_dir = %resolved.state_dir.display(),
        workspace_dir = %resolved.workspace_dir.display(),
        configured = resolved.is_configured(),
        "State directories resolved"
    );

    // The gateway admin token: env override, else persisted, else minted
    let token = dirs::load_or_mint_token(&resolved.state_dir, config.gateway_token.as_deref())
        .map_err(|e| {
            error!(error = %e, "Failed to obtain gateway token");
            e
        })?;

    let shared_dirs = resolved.into_shared();

    // Everything the gate echoes from a subprocess goes through this
    let mut redactor = Redactor::new().with_literal(token.as_str());
    if let Some(password) = &config.admin_password {
        redactor = redactor.with_literal(password.as_str());
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = GatewaySupervisor::new(
        config.clone(),
        Arc::clone(&shared_dirs),
        token.clone(),
    );
    let limiter = Arc::new(RateLimiter::new(&config));
    let admin = AdminApi::new(
        config.clone(),
        Arc::clone(&supervisor),
        Arc::clone(&shared_dirs),
        token,
        redactor,
    );

    let bind_addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.bind, port = config.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = GateServer::new(
        bind_addr,
        config.clone(),
        Arc::clone(&supervisor),
        Arc::clone(&limiter),
        admin,
        shutdown_rx.clone(),
    );

    // Spawn the rate-limiter sweep task
    let sweep_limiter = Arc::clone(&limiter);
    let sweep_interval = config.sweep_interval();
    let sweep_shutdown_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        sweep_loop(sweep_limiter, sweep_interval, sweep_shutdown_rx).await;
    });

    // Spawn the gate server
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gate server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Stop the gateway child before the listener goes away
    info!("Stopping gateway...");
    supervisor.stop().await;

    // Wait for the server to stop (with timeout)
    if tokio::time::timeout(Duration::from_secs(5), server_handle)
        .await
        .is_err()
    {
        warn!("Gate server did not stop in time");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn sweep_loop(
    limiter: Arc<RateLimiter>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                limiter.sweep();
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gate");
    info!(
        bind = %config.bind,
        port = config.port,
        gateway_port = config.gateway_port,
        data_volume = %config.data_volume,
        admin_auth = config.admin_password.is_some(),
        "Server configuration"
    );
    info!(
        max_auth_attempts = config.max_auth_attempts,
        auth_window_secs = config.auth_window_secs,
        lockout_secs = config.lockout_secs,
        max_requests_per_window = config.max_requests_per_window,
        request_window_secs = config.request_window_secs,
        sweep_interval_secs = config.sweep_interval_secs,
        "Admin gate settings"
    );
    info!(
        ready_timeout_secs = config.ready_timeout_secs,
        ready_poll_interval_ms = config.ready_poll_interval_ms,
        stop_grace_ms = config.stop_grace_ms,
        console_timeout_secs = config.console_timeout_secs,
        "Gateway supervision settings"
    );
}
