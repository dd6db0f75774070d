use std::collections::HashMap;
use std::time::Duration;

/// Path prefix for the protected administration surface.
pub const ADMIN_PREFIX: &str = "/admin";

/// Where unconfigured traffic is redirected. Lives under the admin prefix
/// so it inherits the same auth and rate-limit gate.
pub const SETUP_PATH: &str = "/admin/setup";

/// Upper bound for a raw gateway config body, in characters.
pub const CONFIG_MAX_CHARS: usize = 600_000;

/// Upper bound for an uploaded backup archive, in bytes.
pub const IMPORT_MAX_BYTES: u64 = 250 * 1024 * 1024;

/// Global configuration, read once at startup from `GATEWARD_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the public listener (default: 0.0.0.0)
    pub bind: String,

    /// Port for the public listener (default: 8080)
    pub port: u16,

    /// Operator password for the admin surface (HTTP Basic).
    /// If not set, the admin surface answers 503 until one is provided.
    pub admin_password: Option<String>,

    /// Command line used to launch the gateway child process.
    /// Split with shell quoting rules at spawn time.
    pub gateway_command: String,

    /// Loopback port the gateway listens on once started (default: 8787)
    pub gateway_port: u16,

    /// Operator override for the state directory
    pub state_dir: Option<String>,

    /// Operator override for the workspace directory
    pub workspace_dir: Option<String>,

    /// Root of the persistent data volume (default: /data)
    pub data_volume: String,

    /// Token shared with the gateway child. If not set, one is loaded
    /// from the state directory or minted and persisted there.
    pub gateway_token: Option<String>,

    /// Seconds to wait for the gateway to answer on its port after spawn
    pub ready_timeout_secs: u64,

    /// Milliseconds between readiness probes
    pub ready_poll_interval_ms: u64,

    /// Milliseconds between the graceful stop signal and force kill
    pub stop_grace_ms: u64,

    /// Failed auth attempts before a client is locked out
    pub max_auth_attempts: u32,

    /// Window in which failed auth attempts accumulate, in seconds
    pub auth_window_secs: u64,

    /// Lockout duration after too many failed attempts, in seconds
    pub lockout_secs: u64,

    /// Admin requests allowed per client per window
    pub max_requests_per_window: u32,

    /// Length of the request-rate window, in seconds
    pub request_window_secs: u64,

    /// Interval between rate-limiter sweep passes, in seconds
    pub sweep_interval_secs: u64,

    /// Wall-clock limit for a console subprocess, in seconds
    pub console_timeout_secs: u64,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_map(std::env::vars().collect())
    }

    /// Build configuration from an explicit variable map.
    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self {
            bind: get(&vars, "GATEWARD_BIND").unwrap_or_else(default_bind_address),
            port: get_parsed(&vars, "GATEWARD_PORT").unwrap_or_else(default_listen_port),
            admin_password: get(&vars, "GATEWARD_ADMIN_PASSWORD").filter(|p| !p.is_empty()),
            gateway_command: get(&vars, "GATEWARD_GATEWAY_CMD")
                .unwrap_or_else(default_gateway_command),
            gateway_port: get_parsed(&vars, "GATEWARD_GATEWAY_PORT")
                .unwrap_or_else(default_gateway_port),
            state_dir: get(&vars, "GATEWARD_STATE_DIR"),
            workspace_dir: get(&vars, "GATEWARD_WORKSPACE_DIR"),
            data_volume: get(&vars, "GATEWARD_DATA_VOLUME").unwrap_or_else(default_data_volume),
            gateway_token: get(&vars, "GATEWARD_GATEWAY_TOKEN").filter(|t| !t.is_empty()),
            ready_timeout_secs: get_parsed(&vars, "GATEWARD_READY_TIMEOUT_SECS")
                .unwrap_or_else(default_ready_timeout),
            ready_poll_interval_ms: get_parsed(&vars, "GATEWARD_READY_POLL_MS")
                .unwrap_or_else(default_ready_poll_interval),
            stop_grace_ms: get_parsed(&vars, "GATEWARD_STOP_GRACE_MS")
                .unwrap_or_else(default_stop_grace),
            max_auth_attempts: get_parsed(&vars, "GATEWARD_MAX_AUTH_ATTEMPTS")
                .unwrap_or_else(default_max_auth_attempts),
            auth_window_secs: get_parsed(&vars, "GATEWARD_AUTH_WINDOW_SECS")
                .unwrap_or_else(default_auth_window),
            lockout_secs: get_parsed(&vars, "GATEWARD_LOCKOUT_SECS")
                .unwrap_or_else(default_lockout),
            max_requests_per_window: get_parsed(&vars, "GATEWARD_MAX_REQUESTS")
                .unwrap_or_else(default_max_requests),
            request_window_secs: get_parsed(&vars, "GATEWARD_REQUEST_WINDOW_SECS")
                .unwrap_or_else(default_request_window),
            sweep_interval_secs: get_parsed(&vars, "GATEWARD_SWEEP_INTERVAL_SECS")
                .unwrap_or_else(default_sweep_interval),
            console_timeout_secs: get_parsed(&vars, "GATEWARD_CONSOLE_TIMEOUT_SECS")
                .unwrap_or_else(default_console_timeout),
        }
    }

    /// Validate configuration read at startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("GATEWARD_PORT must be greater than 0");
        }
        if self.gateway_port == 0 {
            anyhow::bail!("GATEWARD_GATEWAY_PORT must be greater than 0");
        }
        if self.gateway_command.trim().is_empty() {
            anyhow::bail!("GATEWARD_GATEWAY_CMD must not be empty");
        }
        if let Err(e) = shell_words::split(&self.gateway_command) {
            anyhow::bail!("GATEWARD_GATEWAY_CMD is not a valid command line: {}", e);
        }
        Ok(())
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn auth_window(&self) -> Duration {
        Duration::from_secs(self.auth_window_secs)
    }

    pub fn lockout(&self) -> Duration {
        Duration::from_secs(self.lockout_secs)
    }

    pub fn request_window(&self) -> Duration {
        Duration::from_secs(self.request_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn console_timeout(&self) -> Duration {
        Duration::from_secs(self.console_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_map(HashMap::new())
    }
}

fn get(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key).cloned()
}

fn get_parsed<T: std::str::FromStr>(vars: &HashMap<String, String>, key: &str) -> Option<T> {
    let raw = vars.get(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment variable");
            None
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_gateway_command() -> String {
    "gateway".to_string()
}

fn default_gateway_port() -> u16 {
    8787
}

fn default_data_volume() -> String {
    "/data".to_string()
}

fn default_ready_timeout() -> u64 {
    20 // 20 seconds for the gateway to come up
}

fn default_ready_poll_interval() -> u64 {
    250 // 250ms between probes
}

fn default_stop_grace() -> u64 {
    750 // 750ms between graceful signal and force kill
}

fn default_max_auth_attempts() -> u32 {
    5
}

fn default_auth_window() -> u64 {
    300 // 5 minutes
}

fn default_lockout() -> u64 {
    900 // 15 minutes
}

fn default_max_requests() -> u32 {
    30
}

fn default_request_window() -> u64 {
    60 // 1 minute
}

fn default_sweep_interval() -> u64 {
    300 // 5 minutes
}

fn default_console_timeout() -> u64 {
    60 // 60 seconds for a console subprocess
}
