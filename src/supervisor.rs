//! Gateway process lifecycle management.
//!
//! The gate owns exactly one child: the AI gateway listening on loopback.
//! Everything here revolves around keeping that child's handle consistent
//! under concurrent traffic. Requests that need the gateway race through
//! [`GatewaySupervisor::ensure_running`], which guarantees a single spawn
//! no matter how many callers arrive at once.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dirs::{self, SharedDirs, StateDirectories};
use crate::error::GateError;
use crate::redact::redact;

/// Paths probed for readiness. Any HTTP response on any of them counts,
/// the status code does not matter.
pub const READY_PROBE_PATHS: &[&str] = &["/", "/health", "/api/health"];

/// Outcome of an in-flight start, published to every waiting caller.
#[derive(Debug, Clone)]
enum StartOutcome {
    Pending,
    Ready,
    Failed(GateError),
}

/// Record of the live child. The `Child` itself is owned by the exit
/// monitor task; this holds what the rest of the gate needs to reach it.
struct GatewayProcess {
    pid: u32,
    generation: u64,
    started_at: DateTime<Utc>,
    /// Set before a deliberate stop so the exit monitor does not count the
    /// exit as a crash.
    stopping: Arc<AtomicBool>,
    /// Flipped to true by the exit monitor once the child is reaped.
    exit_rx: watch::Receiver<bool>,
    /// Tells the exit monitor to force kill the child.
    kill_tx: watch::Sender<bool>,
}

/// Counters and liveness info surfaced by the admin status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub starts: u64,
    pub restarts: u64,
    pub crashes: u64,
}

pub struct GatewaySupervisor {
    config: Config,
    dirs: SharedDirs,
    gateway_token: String,
    /// At most one live child at a time.
    process: Mutex<Option<GatewayProcess>>,
    /// Present exactly while a start is in flight. Callers that find it
    /// populated await the shared outcome instead of spawning again.
    starting: Mutex<Option<watch::Receiver<StartOutcome>>>,
    generation: AtomicU64,
    start_count: AtomicU64,
    restart_count: AtomicU64,
    crash_count: AtomicU64,
}

impl GatewaySupervisor {
    pub fn new(config: Config, dirs: SharedDirs, gateway_token: String) -> Arc<Self> {
        Arc::new(Self {
            config,
            dirs,
            gateway_token,
            process: Mutex::new(None),
            starting: Mutex::new(None),
            generation: AtomicU64::new(0),
            start_count: AtomicU64::new(0),
            restart_count: AtomicU64::new(0),
            crash_count: AtomicU64::new(0),
        })
    }

    /// True once the gateway has a persisted configuration file.
    pub fn is_configured(&self) -> bool {
        self.dirs.read().is_configured()
    }

    pub fn is_running(&self) -> bool {
        self.process.lock().is_some()
    }

    pub fn status(&self) -> SupervisorStatus {
        let (pid, started_at) = {
            let guard = self.process.lock();
            match guard.as_ref() {
                Some(p) => (Some(p.pid), Some(p.started_at)),
                None => (None, None),
            }
        };
        SupervisorStatus {
            running: pid.is_some(),
            pid,
            started_at,
            starts: self.start_count.load(Ordering::SeqCst),
            restarts: self.restart_count.load(Ordering::SeqCst),
            crashes: self.crash_count.load(Ordering::SeqCst),
        }
    }

    /// Make sure a gateway process exists, spawning one if needed.
    ///
    /// Concurrent callers during an in-flight start all await that start's
    /// outcome; none of them spawns a second process. A caller that finds a
    /// live handle returns immediately without probing.
    pub async fn ensure_running(self: &Arc<Self>) -> Result<(), GateError> {
        // Check the start slot before the process slot: during a start the
        // handle is registered while readiness polling is still underway.
        // Every slot guard must be dropped before awaiting an outcome, the
        // starter task takes the same lock to clear the slot before it
        // publishes.
        let in_flight = self.starting.lock().clone();
        if let Some(rx) = in_flight {
            return await_outcome(rx).await;
        }
        if self.process.lock().is_some() {
            return Ok(());
        }
        if !self.is_configured() {
            return Err(GateError::NotConfigured);
        }

        let (tx, rx) = watch::channel(StartOutcome::Pending);
        let lost_race = {
            let mut slot = self.starting.lock();
            match slot.clone() {
                Some(existing) => Some(existing),
                None => {
                    *slot = Some(rx.clone());
                    None
                }
            }
        };
        if let Some(existing) = lost_race {
            // Lost the race, join the winner's start
            return await_outcome(existing).await;
        }

        // The actual start runs on its own task so an impatient client
        // hanging up cannot abandon the coordination slot half way.
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.start_once().await;

            // Clear the slot before publishing: a start that begins after
            // this point must never observe this round's receiver.
            *this.starting.lock() = None;

            let outcome = match result {
                Ok(()) => StartOutcome::Ready,
                Err(e) => StartOutcome::Failed(e),
            };
            let _ = tx.send(outcome);
        });

        await_outcome(rx).await
    }

    /// Stop the gateway if it is running. Idempotent.
    ///
    /// Sends a graceful termination signal, waits out the configured grace
    /// period, then force kills. The handle is cleared either way so a child
    /// that ignores signals cannot wedge the supervisor.
    pub async fn stop(&self) {
        let snapshot = {
            let guard = self.process.lock();
            guard
                .as_ref()
                .map(|p| (p.pid, p.generation, Arc::clone(&p.stopping), p.exit_rx.clone()))
        };
        let Some((pid, generation, stopping, mut exit_rx)) = snapshot else {
            debug!("Stop requested with no gateway process running");
            return;
        };

        stopping.store(true, Ordering::SeqCst);
        info!(pid, "Stopping gateway process");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        self.request_kill(generation);

        let grace = self.config.stop_grace();
        let exited = tokio::time::timeout(grace, async {
            loop {
                if *exit_rx.borrow() {
                    return;
                }
                if exit_rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok();

        if !exited {
            warn!(
                pid,
                grace_ms = grace.as_millis() as u64,
                "Gateway did not exit within grace period, force killing"
            );
            self.request_kill(generation);
        }

        let mut slot = self.process.lock();
        if slot.as_ref().map(|p| p.generation) == Some(generation) {
            *slot = None;
        }
    }

    /// Stop then start. The restart counter moves even when the subsequent
    /// start fails, it counts requests, not successes.
    pub async fn restart(self: &Arc<Self>) -> Result<(), GateError> {
        if !self.is_configured() {
            debug!("Restart requested before configuration, nothing to do");
            return Ok(());
        }
        self.stop().await;
        self.restart_count.fetch_add(1, Ordering::SeqCst);
        self.ensure_running().await
    }

    async fn start_once(self: &Arc<Self>) -> Result<(), GateError> {
        let dirs = self.ensure_directories()?;
        self.spawn_gateway(&dirs)?;

        match self.wait_until_ready().await {
            Ok(()) => {
                info!(port = self.config.gateway_port, "Gateway is ready");
                Ok(())
            }
            Err(e) => {
                // On a readiness timeout the child is left alone, it may
                // still come up and serve the next request.
                warn!(error = %e, "Gateway start did not reach readiness");
                Err(e)
            }
        }
    }

    /// Probe both runtime directories, re-resolving the pair once if either
    /// has stopped accepting writes (revoked mounts, permission flips).
    fn ensure_directories(&self) -> Result<StateDirectories, GateError> {
        let current = self.dirs.read().clone();
        if dirs::probe_dir(&current.state_dir) && dirs::probe_dir(&current.workspace_dir) {
            return Ok(current);
        }

        warn!("Runtime directory failed its write probe, re-resolving");
        let fresh = dirs::re_resolve(&self.dirs, &self.config);
        if dirs::probe_dir(&fresh.state_dir) && dirs::probe_dir(&fresh.workspace_dir) {
            return Ok(fresh);
        }

        Err(GateError::SpawnFailed(
            "no writable state or workspace directory".into(),
        ))
    }

    fn spawn_gateway(self: &Arc<Self>, dirs: &StateDirectories) -> Result<(), GateError> {
        let parts = shell_words::split(&self.config.gateway_command)
            .map_err(|e| GateError::SpawnFailed(format!("unparseable gateway command: {}", e)))?;
        let (program, args) = parts
            .split_first()
            .ok_or_else(|| GateError::SpawnFailed("empty gateway command".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&dirs.workspace_dir)
            .env("PORT", self.config.gateway_port.to_string())
            .env("GATEWAY_STATE_DIR", &dirs.state_dir)
            .env("GATEWAY_TOKEN", &self.gateway_token)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| GateError::SpawnFailed(format!("{}: {}", program, e)))?;

        let pid = child.id().unwrap_or(0);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let started_at = Utc::now();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "gateway", pid, "{}", redact(&line));
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "gateway", pid, "{}", redact(&line));
                }
            });
        }

        let stopping = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = watch::channel(false);

        *self.process.lock() = Some(GatewayProcess {
            pid,
            generation,
            started_at,
            stopping: Arc::clone(&stopping),
            exit_rx,
            kill_tx,
        });
        self.start_count.fetch_add(1, Ordering::SeqCst);
        info!(pid, command = %self.config.gateway_command, "Spawned gateway process");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.monitor_exit(child, generation, pid, stopping, exit_tx, kill_rx)
                .await;
        });

        Ok(())
    }

    /// Owns the child until it exits. Reacts to force-kill requests and
    /// classifies the exit as deliberate or a crash.
    async fn monitor_exit(
        &self,
        mut child: Child,
        generation: u64,
        pid: u32,
        stopping: Arc<AtomicBool>,
        exit_tx: watch::Sender<bool>,
        mut kill_rx: watch::Receiver<bool>,
    ) {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                result = kill_rx.changed() => match result {
                    Ok(()) if *kill_rx.borrow() => {
                        let _ = child.start_kill();
                    }
                    Ok(()) => {}
                    // Sender gone means the record was already cleared,
                    // nothing left to do but reap.
                    Err(_) => break child.wait().await,
                },
            }
        };

        let deliberate = stopping.load(Ordering::SeqCst);
        match &status {
            Ok(exit) if deliberate => {
                info!(pid, code = ?exit.code(), "Gateway process exited after stop request");
            }
            // Only a non-zero code or a signal counts as a crash; a clean
            // self-exit is logged but leaves the counter alone.
            Ok(exit) if exit.success() => {
                warn!(pid, "Gateway process exited cleanly without a stop request");
            }
            Ok(exit) => {
                self.crash_count.fetch_add(1, Ordering::SeqCst);
                #[cfg(unix)]
                let signal = std::os::unix::process::ExitStatusExt::signal(exit);
                #[cfg(not(unix))]
                let signal: Option<i32> = None;
                warn!(
                    target: "audit",
                    pid,
                    code = ?exit.code(),
                    signal = ?signal,
                    "Gateway process crashed"
                );
            }
            Err(e) => {
                error!(pid, error = %e, "Failed to reap gateway process");
            }
        }

        let mut slot = self.process.lock();
        if slot.as_ref().map(|p| p.generation) == Some(generation) {
            *slot = None;
        }
        drop(slot);

        let _ = exit_tx.send(true);
    }

    async fn wait_until_ready(&self) -> Result<(), GateError> {
        let deadline = tokio::time::Instant::now() + self.config.ready_timeout();

        loop {
            if self.probe_ready().await {
                return Ok(());
            }
            // The child may have died while we were polling
            if self.process.lock().is_none() {
                return Err(GateError::SpawnFailed(
                    "gateway exited before becoming ready".into(),
                ));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GateError::StartTimeout(self.config.ready_timeout_secs));
            }
            tokio::time::sleep(self.config.ready_poll_interval()).await;
        }
    }

    async fn probe_ready(&self) -> bool {
        for path in READY_PROBE_PATHS {
            if probe_path(self.config.gateway_port, path).await {
                return true;
            }
        }
        false
    }

    fn request_kill(&self, generation: u64) {
        let guard = self.process.lock();
        if let Some(p) = guard.as_ref() {
            if p.generation == generation {
                let _ = p.kill_tx.send(true);
            }
        }
    }
}

/// Wait on a shared start outcome.
async fn await_outcome(mut rx: watch::Receiver<StartOutcome>) -> Result<(), GateError> {
    loop {
        let current = rx.borrow_and_update().clone();
        match current {
            StartOutcome::Ready => return Ok(()),
            StartOutcome::Failed(e) => return Err(e),
            StartOutcome::Pending => {}
        }
        if rx.changed().await.is_err() {
            return Err(GateError::SpawnFailed("start task aborted".into()));
        }
    }
}

/// One raw HTTP request against the loopback gateway. Returns true for any
/// parseable HTTP response.
async fn probe_path(port: u16, path: &str) -> bool {
    let addr = format!("127.0.0.1:{}", port);
    let mut stream =
        match tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            _ => return false,
        };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        path, port
    );
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let mut buf = vec![0u8; 1024];
    match tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/"),
        _ => false,
    }
}
