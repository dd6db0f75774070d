use crate::backup;
use crate::config::{Config, CONFIG_MAX_CHARS, IMPORT_MAX_BYTES, SETUP_PATH};
use crate::console::{Console, ConsoleCommand};
use crate::dirs::{self, SharedDirs};
use crate::error::{empty_body, full_body, GateBody};
use crate::redact::Redactor;
use crate::supervisor::GatewaySupervisor;
use anyhow::{Context, Result};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Version information for the gate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// UTF-8 needs at most four bytes per character, so reading this much is
/// enough to judge the character limit without buffering unbounded input.
const CONFIG_RAW_MAX_BYTES: usize = CONFIG_MAX_CHARS * 4;

/// Console and pairing requests are a few JSON fields at most.
const JSON_BODY_MAX_BYTES: usize = 16 * 1024;

/// Helper to create a JSON response
pub(crate) fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<GateBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response<GateBody> {
    let body = serde_json::json!({ "ok": false, "error": message.into() });
    json_response(status, body.to_string())
}

/// 302 to the setup page, used for every non-admin path while unconfigured.
pub(crate) fn redirect_to_setup() -> Response<GateBody> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(hyper::header::LOCATION, SETUP_PATH)
        .body(empty_body())
        .expect("valid response with StatusCode enum and static header")
}

#[derive(Debug, Deserialize)]
struct ConsoleRunRequest {
    cmd: String,
}

#[derive(Debug, Deserialize)]
struct PairingApproveRequest {
    id: String,
}

#[derive(Debug, Serialize)]
struct DoctorStep {
    name: &'static str,
    ok: bool,
    detail: String,
}

/// Operator-facing API behind the admin gate.
///
/// Authentication and rate limiting happen in the routing layer; every
/// request that reaches `handle` has already passed both.
pub struct AdminApi {
    config: Config,
    supervisor: Arc<GatewaySupervisor>,
    console: Console,
    dirs: SharedDirs,
    gateway_token: String,
    redactor: Redactor,
}

impl AdminApi {
    pub fn new(
        config: Config,
        supervisor: Arc<GatewaySupervisor>,
        dirs: SharedDirs,
        gateway_token: String,
        redactor: Redactor,
    ) -> Self {
        let console = Console::new(config.clone(), Arc::clone(&supervisor), redactor.clone());
        Self {
            config,
            supervisor,
            console,
            dirs,
            gateway_token,
            redactor,
        }
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<GateBody> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "Admin request");

        let result = match (method, path.as_str()) {
            (Method::GET, "/admin") | (Method::GET, "/admin/") => Ok(redirect_to_setup()),
            (Method::GET, "/admin/setup") => Ok(serve_setup_page()),
            (Method::GET, "/admin/status") => self.status().await,
            (Method::POST, "/admin/console/run") => self.console_run(req).await,
            (Method::GET, "/admin/config/raw") => self.get_config_raw().await,
            (Method::POST, "/admin/config/raw") => self.put_config_raw(req).await,
            (Method::POST, "/admin/doctor") => self.doctor(false).await,
            (Method::POST, "/admin/doctor/repair") => self.doctor(true).await,
            (Method::GET, "/admin/pairing/list") => self.pairing_list().await,
            (Method::POST, "/admin/pairing/approve") => self.pairing_approve(req).await,
            (Method::POST, "/admin/pairing/approve-all") => self.pairing_approve_all().await,
            (Method::GET, "/admin/backup/export") => self.backup_export(),
            (Method::POST, "/admin/backup/import") => self.backup_import(req).await,
            _ => Ok(json_error(StatusCode::NOT_FOUND, "not found")),
        };

        result.unwrap_or_else(|e| {
            error!(error = %e, "Admin request failed");
            let message = format!("Internal error: {:#}", e);
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                self.redactor.redact(&message).into_owned(),
            )
        })
    }

    async fn status(&self) -> Result<Response<GateBody>> {
        let (state_dir, workspace_dir, configured) = {
            let d = self.dirs.read();
            (
                d.state_dir.display().to_string(),
                d.workspace_dir.display().to_string(),
                d.is_configured(),
            )
        };
        let body = serde_json::json!({
            "ok": true,
            "name": PKG_NAME,
            "version": VERSION,
            "configured": configured,
            "gateway": self.supervisor.status(),
            "state_dir": state_dir,
            "workspace_dir": workspace_dir,
        });
        Ok(json_response(StatusCode::OK, body.to_string()))
    }

    async fn console_run(&self, req: Request<Incoming>) -> Result<Response<GateBody>> {
        let body = match read_body_capped(req.into_body(), JSON_BODY_MAX_BYTES).await? {
            Some(b) => b,
            None => {
                return Ok(json_error(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "request body too large",
                ));
            }
        };
        let run_req: ConsoleRunRequest = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                return Ok(json_error(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid JSON: {}", e),
                ));
            }
        };

        let command = match ConsoleCommand::from_str(&run_req.cmd) {
            Some(c) => c,
            None => {
                return Ok(json_error(
                    StatusCode::BAD_REQUEST,
                    format!(
                        "Unknown command, allowed: {}",
                        ConsoleCommand::NAMES.join(", ")
                    ),
                ));
            }
        };

        let outcome = self.console.run(command).await;
        Ok(json_response(StatusCode::OK, serde_json::to_string(&outcome)?))
    }

    async fn get_config_raw(&self) -> Result<Response<GateBody>> {
        let path = self.dirs.read().config_file();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(json_response(StatusCode::OK, content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(json_error(StatusCode::NOT_FOUND, "no gateway configuration"))
            }
            Err(e) => Err(e).context("failed to read gateway configuration"),
        }
    }

    async fn put_config_raw(&self, req: Request<Incoming>) -> Result<Response<GateBody>> {
        let body = match read_body_capped(req.into_body(), CONFIG_RAW_MAX_BYTES).await? {
            Some(b) => b,
            None => {
                return Ok(json_error(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "configuration too large",
                ));
            }
        };
        let content = match String::from_utf8(body.to_vec()) {
            Ok(s) => s,
            Err(_) => {
                return Ok(json_error(
                    StatusCode::BAD_REQUEST,
                    "configuration must be valid UTF-8",
                ));
            }
        };
        if content.chars().count() > CONFIG_MAX_CHARS {
            return Ok(json_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("configuration exceeds {} characters", CONFIG_MAX_CHARS),
            ));
        }

        let config_path = self.dirs.read().config_file();
        let backup_name = back_up_existing(&config_path).await?;
        dirs::write_private(&config_path, &content)
            .context("failed to write gateway configuration")?;
        info!(
            target: "audit",
            path = %config_path.display(),
            bytes = content.len(),
            backup = backup_name.as_deref(),
            "Gateway configuration written"
        );

        let body = serde_json::json!({
            "ok": true,
            "bytes": content.len(),
            "backup": backup_name,
        });
        Ok(json_response(StatusCode::OK, body.to_string()))
    }

    /// Ordered health checks; with `repair` each failing step is fixed in
    /// place before the report is assembled.
    async fn doctor(&self, repair: bool) -> Result<Response<GateBody>> {
        let mut steps: Vec<DoctorStep> = Vec::new();

        // Directories first, everything else depends on them.
        let mut snapshot = self.dirs.read().clone();
        let mut state_ok = dirs::probe_dir(&snapshot.state_dir);
        let mut workspace_ok = dirs::probe_dir(&snapshot.workspace_dir);
        if repair && (!state_ok || !workspace_ok) {
            snapshot = dirs::re_resolve(&self.dirs, &self.config);
            state_ok = dirs::probe_dir(&snapshot.state_dir);
            workspace_ok = dirs::probe_dir(&snapshot.workspace_dir);
        }
        steps.push(DoctorStep {
            name: "state_dir",
            ok: state_ok,
            detail: snapshot.state_dir.display().to_string(),
        });
        steps.push(DoctorStep {
            name: "workspace_dir",
            ok: workspace_ok,
            detail: snapshot.workspace_dir.display().to_string(),
        });

        let configured = snapshot.is_configured();
        steps.push(DoctorStep {
            name: "config",
            ok: configured,
            detail: if configured {
                snapshot.config_file().display().to_string()
            } else {
                "no gateway configuration".to_string()
            },
        });

        let mut running = self.supervisor.is_running();
        let mut port_ok = probe_port(self.config.gateway_port).await;
        if repair && configured && (!running || !port_ok) {
            match self.supervisor.restart().await {
                Ok(()) => {
                    running = self.supervisor.is_running();
                    port_ok = probe_port(self.config.gateway_port).await;
                    steps.push(DoctorStep {
                        name: "gateway_restart",
                        ok: true,
                        detail: "gateway restarted".to_string(),
                    });
                }
                Err(e) => {
                    steps.push(DoctorStep {
                        name: "gateway_restart",
                        ok: false,
                        detail: e.to_string(),
                    });
                }
            }
        }
        // Absence is the expected state while unconfigured, not a fault.
        steps.push(DoctorStep {
            name: "gateway_process",
            ok: if configured { running } else { true },
            detail: match (configured, running) {
                (false, _) => "not configured".to_string(),
                (true, true) => "running".to_string(),
                (true, false) => "stopped".to_string(),
            },
        });
        steps.push(DoctorStep {
            name: "gateway_port",
            ok: if configured { port_ok } else { true },
            detail: format!("127.0.0.1:{}", self.config.gateway_port),
        });

        let token_path = snapshot.token_file();
        let mut token_ok = token_path.is_file();
        let mut token_detail = if token_ok {
            token_path.display().to_string()
        } else {
            "token file missing".to_string()
        };
        if repair && !token_ok {
            match dirs::write_private(&token_path, &self.gateway_token) {
                Ok(()) => {
                    token_ok = true;
                    token_detail = "token file restored".to_string();
                }
                Err(e) => {
                    token_detail = self.redactor.redact(&format!("{:#}", e)).into_owned();
                }
            }
        }
        steps.push(DoctorStep {
            name: "gateway_token",
            ok: token_ok,
            detail: token_detail,
        });

        let all_ok = steps.iter().all(|s| s.ok);
        info!(target: "audit", repair, ok = all_ok, "Doctor run finished");

        let body = serde_json::json!({ "ok": all_ok, "repair": repair, "steps": steps });
        Ok(json_response(StatusCode::OK, body.to_string()))
    }

    async fn pairing_list(&self) -> Result<Response<GateBody>> {
        let dir = self.dirs.read().pairing_dir();
        let mut records: Vec<serde_json::Value> = Vec::new();

        match std::fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    let id = match path.file_stem().and_then(|s| s.to_str()) {
                        Some(s) => s.to_string(),
                        None => continue,
                    };
                    let content = match std::fs::read_to_string(&path) {
                        Ok(c) => c,
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Skipping unreadable pairing record");
                            continue;
                        }
                    };
                    match serde_json::from_str::<serde_json::Value>(&content) {
                        Ok(mut record) => {
                            if let Some(obj) = record.as_object_mut() {
                                obj.insert("id".to_string(), serde_json::Value::String(id));
                            }
                            records.push(record);
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Skipping malformed pairing record");
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("failed to read pairing directory"),
        }

        records.sort_by(|a, b| {
            a.get("id")
                .and_then(|v| v.as_str())
                .cmp(&b.get("id").and_then(|v| v.as_str()))
        });

        let count = records.len();
        let body = serde_json::json!({ "ok": true, "pending": records, "count": count });
        Ok(json_response(StatusCode::OK, body.to_string()))
    }

    async fn pairing_approve(&self, req: Request<Incoming>) -> Result<Response<GateBody>> {
        let body = match read_body_capped(req.into_body(), JSON_BODY_MAX_BYTES).await? {
            Some(b) => b,
            None => {
                return Ok(json_error(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "request body too large",
                ));
            }
        };
        let approve: PairingApproveRequest = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                return Ok(json_error(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid JSON: {}", e),
                ));
            }
        };
        if !valid_pairing_id(&approve.id) {
            return Ok(json_error(StatusCode::BAD_REQUEST, "invalid pairing id"));
        }

        info!(target: "audit", id = %approve.id, "Pairing approval requested");
        let outcome = self
            .console
            .run_gateway_cli(&["pairing", "approve", approve.id.as_str()])
            .await;
        Ok(json_response(StatusCode::OK, serde_json::to_string(&outcome)?))
    }

    async fn pairing_approve_all(&self) -> Result<Response<GateBody>> {
        info!(target: "audit", "Approval of all pending pairings requested");
        let outcome = self
            .console
            .run_gateway_cli(&["pairing", "approve", "--all"])
            .await;
        Ok(json_response(StatusCode::OK, serde_json::to_string(&outcome)?))
    }

    fn backup_export(&self) -> Result<Response<GateBody>> {
        let snapshot = self.dirs.read().clone();
        info!(target: "audit", "Backup export started");

        let body = backup::export_archive(snapshot, self.config.data_volume.clone());
        let filename = format!(
            "gateward-backup-{}.tar.gz",
            chrono::Utc::now().format("%Y%m%d-%H%M%S")
        );
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/gzip")
            .header(
                "content-disposition",
                format!("attachment; filename=\"{}\"", filename),
            )
            .body(body)
            .expect("valid response with StatusCode enum and ascii headers"))
    }

    async fn backup_import(&self, req: Request<Incoming>) -> Result<Response<GateBody>> {
        let volume = PathBuf::from(&self.config.data_volume);
        let volume_ok = {
            let d = self.dirs.read();
            d.state_dir.starts_with(&volume) && d.workspace_dir.starts_with(&volume)
        };
        if !volume_ok {
            return Ok(json_error(
                StatusCode::BAD_REQUEST,
                "import requires the canonical data volume layout",
            ));
        }

        let archive = match read_body_capped(req.into_body(), IMPORT_MAX_BYTES as usize).await? {
            Some(b) => b,
            None => {
                warn!(target: "audit", limit = IMPORT_MAX_BYTES, "Backup import rejected, body too large");
                return Ok(json_error(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "archive exceeds import size limit",
                ));
            }
        };

        info!(target: "audit", bytes = archive.len(), "Backup import started");
        self.supervisor.stop().await;

        let summary = backup::import_archive(archive, volume).await?;

        // The response must not wait on the gateway coming back up.
        let restarting = self.supervisor.is_configured();
        if restarting {
            let supervisor = Arc::clone(&self.supervisor);
            tokio::spawn(async move {
                if let Err(e) = supervisor.restart().await {
                    warn!(error = %e, "Gateway restart after import failed");
                }
            });
        }

        let body = serde_json::json!({
            "ok": true,
            "entries_written": summary.entries_written,
            "entries_skipped": summary.entries_skipped,
            "restarting": restarting,
        });
        Ok(json_response(StatusCode::OK, body.to_string()))
    }
}

fn valid_pairing_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Read a request body into memory, refusing to buffer more than `cap`
/// bytes. Returns `None` once the cap is crossed; the connection is dropped
/// with the response, which aborts the remaining transfer.
async fn read_body_capped<B>(body: B, cap: usize) -> Result<Option<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let mut body = std::pin::pin!(body);
    let mut buf: Vec<u8> = Vec::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.context("failed to read request body")?;
        if let Some(chunk) = frame.data_ref() {
            if buf.len() + chunk.len() > cap {
                return Ok(None);
            }
            buf.extend_from_slice(chunk);
        }
    }
    Ok(Some(Bytes::from(buf)))
}

/// Copy the existing config aside before overwriting. Returns the backup
/// file name when a copy was made.
async fn back_up_existing(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("gateway.json");
    let backup_name = format!(
        "{}.{}.bak",
        file_name,
        chrono::Utc::now().format("%Y%m%d%H%M%S")
    );
    let backup_path = path.with_file_name(&backup_name);
    tokio::fs::copy(path, &backup_path)
        .await
        .context("failed to back up existing configuration")?;
    Ok(Some(backup_name))
}

async fn probe_port(port: u16) -> bool {
    tokio::time::timeout(
        Duration::from_secs(2),
        tokio::net::TcpStream::connect(("127.0.0.1", port)),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false)
}

fn serve_setup_page() -> Response<GateBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/html; charset=utf-8")
        .body(full_body(SETUP_PAGE))
        .expect("valid response with StatusCode enum and static header")
}

const SETUP_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>gateward setup</title>
<style>
  body { font-family: system-ui, sans-serif; max-width: 720px; margin: 2rem auto; padding: 0 1rem; color: #222; }
  h1 { font-size: 1.4rem; }
  textarea { width: 100%; height: 320px; font-family: monospace; font-size: 0.85rem; }
  button { padding: 0.4rem 1rem; margin-right: 0.5rem; }
  #msg { margin-top: 0.75rem; font-size: 0.9rem; }
  .links { margin-top: 1.5rem; font-size: 0.85rem; }
</style>
</head>
<body>
<h1>gateward setup</h1>
<p>Paste the gateway configuration below and save it. The gateway starts on
the first proxied request once a configuration is in place.</p>
<textarea id="cfg" spellcheck="false" placeholder='{ "providers": { ... } }'></textarea>
<div>
  <button id="save">Save configuration</button>
  <button id="reload">Reload</button>
</div>
<div id="msg"></div>
<div class="links"><a href="/admin/status">status</a></div>
<script>
const msg = document.getElementById('msg');
async function load() {
  const res = await fetch('/admin/config/raw');
  if (res.ok) {
    document.getElementById('cfg').value = await res.text();
    msg.textContent = 'Loaded existing configuration.';
  } else {
    msg.textContent = 'No configuration saved yet.';
  }
}
document.getElementById('save').addEventListener('click', async () => {
  const res = await fetch('/admin/config/raw', {
    method: 'POST',
    body: document.getElementById('cfg').value,
  });
  const body = await res.json().catch(() => ({}));
  msg.textContent = res.ok ? 'Saved.' : ('Save failed: ' + (body.error || res.status));
});
document.getElementById('reload').addEventListener('click', load);
load();
</script>
</body>
</html>
"#;
