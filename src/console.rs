//! Admin console command execution.
//!
//! The console endpoint accepts command names from a closed allowlist,
//! never shell strings. Lifecycle commands call straight into the
//! supervisor; the rest shell out to the gateway CLI with a hard timeout.
//! All output is redacted before it can reach an HTTP response.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::GateError;
use crate::redact::Redactor;
use crate::supervisor::GatewaySupervisor;

/// Delay between the graceful signal and the force kill for a console
/// subprocess that outlived its timeout.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// The commands the console accepts. Anything else is rejected before a
/// subprocess is ever involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    GatewayStart,
    GatewayStop,
    GatewayRestart,
    GatewayStatus,
    GatewayVersion,
}

impl ConsoleCommand {
    /// Every accepted command name, for error messages.
    pub const NAMES: &'static [&'static str] = &[
        "gateway.start",
        "gateway.stop",
        "gateway.restart",
        "gateway.status",
        "gateway.version",
    ];

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "gateway.start" => Some(ConsoleCommand::GatewayStart),
            "gateway.stop" => Some(ConsoleCommand::GatewayStop),
            "gateway.restart" => Some(ConsoleCommand::GatewayRestart),
            "gateway.status" => Some(ConsoleCommand::GatewayStatus),
            "gateway.version" => Some(ConsoleCommand::GatewayVersion),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsoleCommand::GatewayStart => "gateway.start",
            ConsoleCommand::GatewayStop => "gateway.stop",
            ConsoleCommand::GatewayRestart => "gateway.restart",
            ConsoleCommand::GatewayStatus => "gateway.status",
            ConsoleCommand::GatewayVersion => "gateway.version",
        }
    }
}

/// Result of one console command or CLI invocation.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub ok: bool,
    pub output: String,
    pub timed_out: bool,
}

impl CommandOutcome {
    fn finished(ok: bool, output: impl Into<String>) -> Self {
        Self {
            ok,
            output: output.into(),
            timed_out: false,
        }
    }
}

/// Executes console commands against the supervisor and the gateway CLI.
pub struct Console {
    config: Config,
    supervisor: Arc<GatewaySupervisor>,
    redactor: Redactor,
}

impl Console {
    pub fn new(config: Config, supervisor: Arc<GatewaySupervisor>, redactor: Redactor) -> Self {
        Self {
            config,
            supervisor,
            redactor,
        }
    }

    pub async fn run(&self, command: ConsoleCommand) -> CommandOutcome {
        info!(target: "audit", command = command.as_str(), "Console command invoked");

        let outcome = match command {
            ConsoleCommand::GatewayStart => {
                lifecycle(self.supervisor.ensure_running().await, "gateway started")
            }
            ConsoleCommand::GatewayStop => {
                self.supervisor.stop().await;
                CommandOutcome::finished(true, "gateway stopped")
            }
            ConsoleCommand::GatewayRestart => {
                lifecycle(self.supervisor.restart().await, "gateway restarted")
            }
            ConsoleCommand::GatewayStatus => {
                let status = self.supervisor.status();
                let text = serde_json::to_string_pretty(&status)
                    .unwrap_or_else(|_| "status unavailable".to_string());
                CommandOutcome::finished(true, text)
            }
            ConsoleCommand::GatewayVersion => self.run_gateway_cli(&["--version"]).await,
        };

        // Redaction has no opt-out, lifecycle messages included
        CommandOutcome {
            output: self.redactor.redact(&outcome.output).into_owned(),
            ..outcome
        }
    }

    /// Invoke the gateway CLI binary with extra arguments. Also used by the
    /// pairing endpoints, which approve devices through the CLI.
    pub async fn run_gateway_cli(&self, extra_args: &[&str]) -> CommandOutcome {
        let parts = match shell_words::split(&self.config.gateway_command) {
            Ok(parts) if !parts.is_empty() => parts,
            _ => return CommandOutcome::finished(false, "gateway command is not runnable"),
        };

        let mut args: Vec<String> = parts[1..].to_vec();
        args.extend(extra_args.iter().map(|s| s.to_string()));

        let mut outcome = run_cmd(&parts[0], &args, self.config.console_timeout()).await;
        outcome.output = self.redactor.redact(&outcome.output).into_owned();
        outcome
    }
}

fn lifecycle(result: Result<(), GateError>, success: &str) -> CommandOutcome {
    match result {
        Ok(()) => CommandOutcome::finished(true, success),
        Err(e) => CommandOutcome::finished(false, e.to_string()),
    }
}

/// Run one subprocess to completion, collecting stdout and stderr.
///
/// The call suspends until the child closes its output streams or the
/// timeout fires. On timeout the child receives the graceful signal first
/// and a kill five seconds later.
pub async fn run_cmd(program: &str, args: &[String], limit: Duration) -> CommandOutcome {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return CommandOutcome::finished(false, format!("failed to spawn {}: {}", program, e))
        }
    };
    let pid = child.id();

    let mut stdout = child.stdout.take().expect("stdout is piped");
    let mut stderr = child.stderr.take().expect("stderr is piped");

    let collected = tokio::time::timeout(limit, async {
        let mut out = String::new();
        let mut err = String::new();
        let _ = tokio::join!(stdout.read_to_string(&mut out), stderr.read_to_string(&mut err));
        let status = child.wait().await;
        (status, out, err)
    })
    .await;

    match collected {
        Ok((Ok(status), out, err)) => {
            let mut output = out;
            if !err.is_empty() {
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&err);
            }
            CommandOutcome::finished(status.success(), output)
        }
        Ok((Err(e), ..)) => {
            CommandOutcome::finished(false, format!("failed to wait for {}: {}", program, e))
        }
        Err(_) => {
            warn!(
                program,
                timeout_secs = limit.as_secs(),
                "Console subprocess timed out, terminating"
            );
            #[cfg(unix)]
            if let Some(pid) = pid {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
            #[cfg(not(unix))]
            let _ = pid;
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
                let _ = child.kill().await;
            }
            CommandOutcome {
                ok: false,
                output: format!("command timed out after {} seconds", limit.as_secs()),
                timed_out: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirs::StateDirectories;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn test_console(tmp: &TempDir, gateway_command: &str) -> Console {
        let state = tmp.path().join("state");
        let workspace = tmp.path().join("workspace");
        std::fs::create_dir_all(&state).unwrap();
        std::fs::create_dir_all(&workspace).unwrap();

        let vars: HashMap<String, String> = [
            ("GATEWARD_GATEWAY_CMD", gateway_command),
            ("GATEWARD_STATE_DIR", state.to_str().unwrap()),
            ("GATEWARD_WORKSPACE_DIR", workspace.to_str().unwrap()),
            ("GATEWARD_CONSOLE_TIMEOUT_SECS", "10"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let config = Config::from_map(vars);

        let dirs = StateDirectories {
            state_dir: state,
            workspace_dir: workspace,
        }
        .into_shared();
        let supervisor = GatewaySupervisor::new(config.clone(), dirs, "test-token".into());
        Console::new(config, supervisor, Redactor::new())
    }

    #[test]
    fn test_command_names_round_trip() {
        for name in ConsoleCommand::NAMES {
            let command = ConsoleCommand::from_str(name).expect("listed name parses");
            assert_eq!(command.as_str(), *name);
        }
    }

    #[test]
    fn test_unknown_commands_rejected() {
        assert!(ConsoleCommand::from_str("rm -rf /").is_none());
        assert!(ConsoleCommand::from_str("gateway.logs").is_none());
        assert!(ConsoleCommand::from_str("gateway.restart; reboot").is_none());
        assert!(ConsoleCommand::from_str("").is_none());
    }

    #[tokio::test]
    async fn test_run_cmd_captures_stdout() {
        let outcome = run_cmd("echo", &args(&["hello"]), Duration::from_secs(5)).await;
        assert!(outcome.ok);
        assert!(!outcome.timed_out);
        assert!(outcome.output.contains("hello"));
    }

    #[tokio::test]
    async fn test_run_cmd_captures_stderr_and_exit_code() {
        let outcome = run_cmd(
            "sh",
            &args(&["-c", "echo oops >&2; exit 3"]),
            Duration::from_secs(5),
        )
        .await;
        assert!(!outcome.ok);
        assert!(outcome.output.contains("oops"));
    }

    #[tokio::test]
    async fn test_run_cmd_missing_binary() {
        let outcome = run_cmd(
            "/nonexistent/gateward-console-test",
            &args(&[]),
            Duration::from_secs(5),
        )
        .await;
        assert!(!outcome.ok);
        assert!(outcome.output.contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_run_cmd_timeout_kills_child() {
        let started = std::time::Instant::now();
        let outcome = run_cmd("sleep", &args(&["30"]), Duration::from_millis(300)).await;

        assert!(!outcome.ok);
        assert!(outcome.timed_out);
        assert!(outcome.output.contains("timed out"));
        // graceful signal lands well before the five second force kill
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_console_status_without_gateway() {
        let tmp = TempDir::new().unwrap();
        let console = test_console(&tmp, "sleep 30");

        let outcome = console.run(ConsoleCommand::GatewayStatus).await;
        assert!(outcome.ok);
        assert!(outcome.output.contains("\"running\": false"));
    }

    #[tokio::test]
    async fn test_console_stop_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let console = test_console(&tmp, "sleep 30");

        let outcome = console.run(ConsoleCommand::GatewayStop).await;
        assert!(outcome.ok);
        assert_eq!(outcome.output, "gateway stopped");
    }

    #[tokio::test]
    async fn test_console_start_unconfigured_reports_error() {
        let tmp = TempDir::new().unwrap();
        let console = test_console(&tmp, "sleep 30");

        let outcome = console.run(ConsoleCommand::GatewayStart).await;
        assert!(!outcome.ok);
        assert!(outcome.output.contains("not configured"));
    }

    #[tokio::test]
    async fn test_gateway_cli_output_is_redacted() {
        let tmp = TempDir::new().unwrap();
        let console = test_console(&tmp, "echo");

        let outcome = console
            .run_gateway_cli(&["api_key=sk1234567890abcdef"])
            .await;
        assert!(outcome.ok);
        assert!(!outcome.output.contains("sk1234567890abcdef"));
        assert!(outcome.output.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_gateway_version_runs_cli() {
        let tmp = TempDir::new().unwrap();
        let console = test_console(&tmp, "echo gateway-cli");

        let outcome = console.run(ConsoleCommand::GatewayVersion).await;
        assert!(outcome.ok);
        assert!(outcome.output.contains("gateway-cli --version"));
    }
}
