//! Integration tests for the gateward gate
//!
//! Every test stands up a complete gate (listener, supervisor, rate
//! limiter, admin surface) on its own loopback port, with all state under
//! a private temp volume. Where gateway behavior matters a raw TCP stub
//! plays the gateway on the configured loopback port.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use gateward::admin::AdminApi;
use gateward::config::Config;
use gateward::dirs::{load_or_mint_token, StateDirectories};
use gateward::ratelimit::RateLimiter;
use gateward::redact::Redactor;
use gateward::server::GateServer;
use gateward::supervisor::GatewaySupervisor;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const PASSWORD: &str = "test-password";

/// One running gate with its temp volume and lifecycle handles.
struct TestGate {
    volume: TempDir,
    supervisor: Arc<GatewaySupervisor>,
    shutdown_tx: watch::Sender<bool>,
}

impl TestGate {
    fn state_dir(&self) -> std::path::PathBuf {
        self.volume.path().join("state")
    }

    /// Persist a gateway configuration so the gate counts as configured.
    fn configure(&self) {
        std::fs::create_dir_all(self.state_dir()).unwrap();
        std::fs::write(
            self.state_dir().join("gateway.json"),
            b"{\"model\":\"default\"}",
        )
        .unwrap();
    }

    /// Stop the listener and reap any gateway process it spawned.
    async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.supervisor.stop().await;
    }
}

/// Stand up a gate on `port`. `overrides` land on top of defaults that
/// keep every timeout short and all state inside the temp volume.
async fn start_gate(port: u16, overrides: &[(&str, &str)]) -> TestGate {
    let volume = TempDir::new().unwrap();

    let mut vars: HashMap<String, String> = HashMap::new();
    vars.insert("GATEWARD_BIND".into(), "127.0.0.1".into());
    vars.insert("GATEWARD_PORT".into(), port.to_string());
    vars.insert(
        "GATEWARD_DATA_VOLUME".into(),
        volume.path().to_str().unwrap().to_string(),
    );
    vars.insert("GATEWARD_ADMIN_PASSWORD".into(), PASSWORD.into());
    vars.insert("GATEWARD_GATEWAY_CMD".into(), "sleep 30".into());
    vars.insert("GATEWARD_READY_TIMEOUT_SECS".into(), "3".into());
    vars.insert("GATEWARD_READY_POLL_MS".into(), "50".into());
    vars.insert("GATEWARD_STOP_GRACE_MS".into(), "100".into());
    for (key, value) in overrides {
        vars.insert(key.to_string(), value.to_string());
    }

    let config = Config::from_map(vars);
    let resolved = StateDirectories::resolve(&config);
    let token = load_or_mint_token(&resolved.state_dir, config.gateway_token.as_deref()).unwrap();
    let dirs = resolved.into_shared();

    let mut redactor = Redactor::new().with_literal(token.clone());
    if let Some(password) = &config.admin_password {
        redactor = redactor.with_literal(password.clone());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = GatewaySupervisor::new(config.clone(), Arc::clone(&dirs), token.clone());
    let limiter = Arc::new(RateLimiter::new(&config));
    let admin = AdminApi::new(
        config.clone(),
        Arc::clone(&supervisor),
        Arc::clone(&dirs),
        token,
        redactor,
    );

    let bind_addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let server = GateServer::new(
        bind_addr,
        config,
        Arc::clone(&supervisor),
        limiter,
        admin,
        shutdown_rx,
    );
    tokio::spawn(server.run());

    assert!(
        wait_for_port(port, Duration::from_secs(5)).await,
        "Gate did not start listening on port {}",
        port
    );

    TestGate {
        volume,
        supervisor,
        shutdown_tx,
    }
}

/// Raw TCP stand-in for the gateway: upgrade requests get a 101 and a byte
/// echo afterwards, everything else a small 200. Readiness probes from the
/// supervisor land here too and count as any other request.
async fn spawn_gateway_stub(port: u16) {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("bind gateway stub");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let Ok(n) = stream.read(&mut buf).await else {
                    return;
                };
                let head = String::from_utf8_lossy(&buf[..n]).to_lowercase();
                if head.contains("upgrade: websocket") {
                    let response = "HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\nconnection: Upgrade\r\n\r\n";
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                    let mut echo = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut echo).await {
                        if n == 0 || stream.write_all(&echo[..n]).await.is_err() {
                            break;
                        }
                    }
                } else {
                    let response =
                        "HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhello";
                    let _ = stream.write_all(response.as_bytes()).await;
                }
            });
        }
    });
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Basic credentials header value for the test operator password.
fn basic_auth(password: &str) -> String {
    let encoded = base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        format!("admin:{}", password),
    );
    format!("Basic {}", encoded)
}

/// Send one raw HTTP/1.1 request and collect the whole response.
async fn http_raw(port: u16, request: &[u8]) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;
    stream.write_all(request).await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(response)
}

/// Send a simple HTTP GET and get the response as text
async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        path, port
    );
    let response = http_raw(port, request.as_bytes()).await?;
    Ok(String::from_utf8_lossy(&response).into_owned())
}

/// GET with the operator's Basic credentials (for admin endpoints)
async fn http_get_with_auth(
    port: u16,
    path: &str,
    password: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nAuthorization: {}\r\nConnection: close\r\n\r\n",
        path,
        port,
        basic_auth(password)
    );
    let response = http_raw(port, request.as_bytes()).await?;
    Ok(String::from_utf8_lossy(&response).into_owned())
}

/// POST with Basic credentials and a body
async fn http_post_with_auth(
    port: u16,
    path: &str,
    password: &str,
    body: &[u8],
) -> Result<String, Box<dyn std::error::Error>> {
    let mut request = format!(
        "POST {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nAuthorization: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        path,
        port,
        basic_auth(password),
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(body);
    let response = http_raw(port, &request).await?;
    Ok(String::from_utf8_lossy(&response).into_owned())
}

/// Split a raw response into head text and decoded body, undoing chunked
/// transfer coding when present.
fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
    let boundary = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
        .unwrap_or(raw.len());
    let (head, body) = raw.split_at(boundary);
    let head = String::from_utf8_lossy(head).into_owned();

    let body = if head.to_lowercase().contains("transfer-encoding: chunked") {
        decode_chunked(body)
    } else {
        body.to_vec()
    };
    (head, body)
}

fn decode_chunked(mut body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(line_end) = body.windows(2).position(|w| w == b"\r\n") {
        let size_text = String::from_utf8_lossy(&body[..line_end]);
        let size = size_text
            .trim()
            .split(';')
            .next()
            .and_then(|s| usize::from_str_radix(s, 16).ok())
            .unwrap_or(0);
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        if body.len() < start + size + 2 {
            break;
        }
        out.extend_from_slice(&body[start..start + size]);
        body = &body[start + size + 2..];
    }
    out
}

/// Build a small gzip-compressed tar in memory.
fn build_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, contents) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *contents)
            .expect("append archive entry");
    }
    builder
        .into_inner()
        .expect("finish tar stream")
        .finish()
        .expect("finish gzip stream")
}

// ============================================================================
// Public Surface Tests
// ============================================================================

#[tokio::test]
async fn test_health_is_served_without_credentials() {
    let gate = start_gate(31900, &[]).await;

    let response = http_get(31900, "/health").await.unwrap();
    assert!(response.contains("HTTP/1.1 200"), "Response: {}", response);
    assert!(response.contains("\"ok\":true"));
    assert!(response.contains("\"configured\":false"));
    assert!(response.contains("\"gateway\":\"stopped\""));

    gate.shutdown().await;
}

#[tokio::test]
async fn test_unconfigured_traffic_redirects_to_setup() {
    let gate = start_gate(31901, &[]).await;

    let response = http_get(31901, "/v1/messages").await.unwrap();
    assert!(response.contains("HTTP/1.1 302"), "Response: {}", response);
    assert!(response.to_lowercase().contains("location: /admin/setup"));

    gate.shutdown().await;
}

// ============================================================================
// Admin Gate Tests
// ============================================================================

#[tokio::test]
async fn test_admin_challenges_without_credentials() {
    let gate = start_gate(31902, &[]).await;

    let response = http_get(31902, "/admin/status").await.unwrap();
    assert!(response.contains("HTTP/1.1 401"), "Response: {}", response);
    assert!(response.contains("AUTH_REQUIRED"));
    assert!(response.contains("Basic realm=\"gateward\""));

    // hardening headers ride on error responses too
    let lower = response.to_lowercase();
    assert!(lower.contains("x-content-type-options: nosniff"));
    assert!(lower.contains("cache-control: no-store"));

    gate.shutdown().await;
}

#[tokio::test]
async fn test_admin_status_with_credentials() {
    let gate = start_gate(31903, &[]).await;

    let response = http_get_with_auth(31903, "/admin/status", PASSWORD)
        .await
        .unwrap();
    assert!(response.contains("HTTP/1.1 200"), "Response: {}", response);
    assert!(response.contains("\"name\":\"gateward\""));
    assert!(response.contains("\"configured\":false"));
    assert!(response.contains("\"running\":false"));

    gate.shutdown().await;
}

#[tokio::test]
async fn test_wrong_password_locks_the_client_out() {
    let gate = start_gate(31904, &[("GATEWARD_MAX_AUTH_ATTEMPTS", "2")]).await;

    let first = http_get_with_auth(31904, "/admin/status", "wrong-guess")
        .await
        .unwrap();
    assert!(first.contains("HTTP/1.1 401"), "Response: {}", first);

    // second failure trips the lockout
    let second = http_get_with_auth(31904, "/admin/status", "wrong-guess")
        .await
        .unwrap();
    assert!(second.contains("HTTP/1.1 429"), "Response: {}", second);
    assert!(second.contains("LOCKED_OUT"));

    // even the right password is refused while locked out
    let third = http_get_with_auth(31904, "/admin/status", PASSWORD)
        .await
        .unwrap();
    assert!(third.contains("HTTP/1.1 429"), "Response: {}", third);
    assert!(third.contains("LOCKED_OUT"));
    assert!(third.to_lowercase().contains("retry-after:"));

    gate.shutdown().await;
}

#[tokio::test]
async fn test_admin_request_budget_is_enforced() {
    let gate = start_gate(31905, &[("GATEWARD_MAX_REQUESTS", "3")]).await;

    for _ in 0..3 {
        let response = http_get_with_auth(31905, "/admin/status", PASSWORD)
            .await
            .unwrap();
        assert!(response.contains("HTTP/1.1 200"), "Response: {}", response);
    }

    let blocked = http_get_with_auth(31905, "/admin/status", PASSWORD)
        .await
        .unwrap();
    assert!(blocked.contains("HTTP/1.1 429"), "Response: {}", blocked);
    assert!(blocked.contains("RATE_LIMITED"));
    assert!(blocked.to_lowercase().contains("retry-after:"));

    gate.shutdown().await;
}

#[tokio::test]
async fn test_admin_disabled_without_password() {
    let gate = start_gate(31912, &[("GATEWARD_ADMIN_PASSWORD", "")]).await;

    let response = http_get(31912, "/admin/status").await.unwrap();
    assert!(response.contains("HTTP/1.1 503"), "Response: {}", response);
    assert!(response.contains("ADMIN_DISABLED"));

    gate.shutdown().await;
}

// ============================================================================
// Proxy Tests
// ============================================================================

#[tokio::test]
async fn test_configured_requests_reach_the_gateway() {
    spawn_gateway_stub(31950).await;
    let gate = start_gate(31906, &[("GATEWARD_GATEWAY_PORT", "31950")]).await;
    gate.configure();

    // first request starts the gateway, probes it, then forwards
    let response = http_get(31906, "/v1/messages").await.unwrap();
    assert!(response.contains("HTTP/1.1 200"), "Response: {}", response);
    assert!(response.ends_with("hello"), "Response: {}", response);

    // gate headers are stamped onto proxied responses
    assert!(response
        .to_lowercase()
        .contains("x-content-type-options: nosniff"));

    gate.shutdown().await;
}

#[tokio::test]
async fn test_websocket_upgrade_round_trip() {
    spawn_gateway_stub(31951).await;
    let gate = start_gate(31907, &[("GATEWARD_GATEWAY_PORT", "31951")]).await;
    gate.configure();

    let mut stream = TcpStream::connect("127.0.0.1:31907").await.unwrap();
    let request = format!(
        "GET /ws HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        31907
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    // read until the response head is complete
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "gate closed before completing the upgrade");
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let head_text = String::from_utf8_lossy(&head);
    assert!(
        head_text.starts_with("HTTP/1.1 101"),
        "Response: {}",
        head_text
    );

    // bytes flow both ways on the upgraded connection
    stream.write_all(b"ping-1").await.unwrap();
    let n = stream.read(&mut chunk).await.unwrap();
    assert_eq!(&chunk[..n], b"ping-1");

    gate.shutdown().await;
}

// ============================================================================
// Console and Configuration Tests
// ============================================================================

#[tokio::test]
async fn test_console_runs_allowlisted_commands_only() {
    let gate = start_gate(31908, &[]).await;

    let response = http_post_with_auth(
        31908,
        "/admin/console/run",
        PASSWORD,
        br#"{"cmd":"gateway.status"}"#,
    )
    .await
    .unwrap();
    assert!(response.contains("HTTP/1.1 200"), "Response: {}", response);
    assert!(response.contains("\"ok\":true"));
    assert!(response.contains("running"));

    let rejected = http_post_with_auth(
        31908,
        "/admin/console/run",
        PASSWORD,
        br#"{"cmd":"rm -rf /"}"#,
    )
    .await
    .unwrap();
    assert!(rejected.contains("HTTP/1.1 400"), "Response: {}", rejected);
    assert!(rejected.contains("Unknown command"));

    gate.shutdown().await;
}

#[tokio::test]
async fn test_console_restart_moves_the_counter() {
    spawn_gateway_stub(31952).await;
    let gate = start_gate(31915, &[("GATEWARD_GATEWAY_PORT", "31952")]).await;
    gate.configure();

    let response = http_post_with_auth(
        31915,
        "/admin/console/run",
        PASSWORD,
        br#"{"cmd":"gateway.restart"}"#,
    )
    .await
    .unwrap();
    assert!(response.contains("HTTP/1.1 200"), "Response: {}", response);
    assert!(response.contains("gateway restarted"));

    let status = http_get_with_auth(31915, "/admin/status", PASSWORD)
        .await
        .unwrap();
    assert!(status.contains("\"restarts\":1"), "Response: {}", status);
    assert!(status.contains("\"running\":true"), "Response: {}", status);

    gate.shutdown().await;
}

#[tokio::test]
async fn test_small_json_endpoints_cap_their_bodies() {
    let gate = start_gate(31916, &[]).await;
    let oversized = vec![b'a'; 16_500];

    let refused = http_post_with_auth(31916, "/admin/console/run", PASSWORD, &oversized)
        .await
        .unwrap();
    assert!(refused.contains("HTTP/1.1 413"), "Response: {}", refused);
    assert!(refused.contains("request body too large"));

    let refused = http_post_with_auth(31916, "/admin/pairing/approve", PASSWORD, &oversized)
        .await
        .unwrap();
    assert!(refused.contains("HTTP/1.1 413"), "Response: {}", refused);

    gate.shutdown().await;
}

#[tokio::test]
async fn test_config_raw_round_trip_and_size_cap() {
    let gate = start_gate(31909, &[]).await;

    let missing = http_get_with_auth(31909, "/admin/config/raw", PASSWORD)
        .await
        .unwrap();
    assert!(missing.contains("HTTP/1.1 404"), "Response: {}", missing);

    let written = http_post_with_auth(
        31909,
        "/admin/config/raw",
        PASSWORD,
        br#"{"model":"default"}"#,
    )
    .await
    .unwrap();
    assert!(written.contains("HTTP/1.1 200"), "Response: {}", written);
    assert!(written.contains("\"ok\":true"));

    let read_back = http_get_with_auth(31909, "/admin/config/raw", PASSWORD)
        .await
        .unwrap();
    assert!(read_back.contains("HTTP/1.1 200"));
    assert!(read_back.contains(r#"{"model":"default"}"#));

    // one character over the limit is refused and the old config survives
    let oversized = "a".repeat(600_001);
    let refused = http_post_with_auth(31909, "/admin/config/raw", PASSWORD, oversized.as_bytes())
        .await
        .unwrap();
    assert!(refused.contains("HTTP/1.1 413"), "Response: {}", refused);

    let after = http_get_with_auth(31909, "/admin/config/raw", PASSWORD)
        .await
        .unwrap();
    assert!(after.contains(r#"{"model":"default"}"#));

    gate.shutdown().await;
}

// ============================================================================
// Backup Tests
// ============================================================================

#[tokio::test]
async fn test_backup_export_streams_a_tarball() {
    let gate = start_gate(31910, &[]).await;
    gate.configure();

    let request = format!(
        "GET /admin/backup/export HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nAuthorization: {}\r\nConnection: close\r\n\r\n",
        31910,
        basic_auth(PASSWORD)
    );
    let raw = http_raw(31910, request.as_bytes()).await.unwrap();
    let (head, body) = split_response(&raw);

    assert!(head.contains("HTTP/1.1 200"), "Response: {}", head);
    assert!(head.to_lowercase().contains("application/gzip"));
    assert!(head.contains("gateward-backup-"));

    // gzip magic at the front of the streamed body
    assert!(body.len() > 2, "archive body is empty");
    assert_eq!(&body[..2], &[0x1f, 0x8b]);

    gate.shutdown().await;
}

#[tokio::test]
async fn test_backup_import_restores_under_the_volume() {
    let gate = start_gate(31911, &[]).await;

    let archive = build_archive(&[("state/restored.json", b"{\"device\":\"laptop\"}")]);
    let response = http_post_with_auth(31911, "/admin/backup/import", PASSWORD, &archive)
        .await
        .unwrap();
    assert!(response.contains("HTTP/1.1 200"), "Response: {}", response);
    assert!(response.contains("\"entries_written\":1"));

    let restored = gate.volume.path().join("state").join("restored.json");
    assert_eq!(std::fs::read(&restored).unwrap(), b"{\"device\":\"laptop\"}");

    gate.shutdown().await;
}

// ============================================================================
// Doctor and Pairing Tests
// ============================================================================

#[tokio::test]
async fn test_doctor_reports_ordered_steps() {
    let gate = start_gate(31913, &[]).await;

    let response = http_post_with_auth(31913, "/admin/doctor", PASSWORD, b"")
        .await
        .unwrap();
    assert!(response.contains("HTTP/1.1 200"), "Response: {}", response);

    // directories and the minted token pass, the missing config does not
    assert!(response.contains("\"ok\":false"));
    assert!(response.contains("\"name\":\"state_dir\""));
    assert!(response.contains("no gateway configuration"));
    assert!(response.contains("not configured"));
    assert!(response.contains("\"repair\":false"));

    gate.shutdown().await;
}

#[tokio::test]
async fn test_pairing_list_reads_state_records() {
    let gate = start_gate(31914, &[]).await;

    let empty = http_get_with_auth(31914, "/admin/pairing/list", PASSWORD)
        .await
        .unwrap();
    assert!(empty.contains("HTTP/1.1 200"), "Response: {}", empty);
    assert!(empty.contains("\"count\":0"));

    let pairing_dir = gate.state_dir().join("pairing");
    std::fs::create_dir_all(&pairing_dir).unwrap();
    std::fs::write(pairing_dir.join("req-abc.json"), br#"{"device":"laptop"}"#).unwrap();

    let listed = http_get_with_auth(31914, "/admin/pairing/list", PASSWORD)
        .await
        .unwrap();
    assert!(listed.contains("\"count\":1"), "Response: {}", listed);
    assert!(listed.contains("\"id\":\"req-abc\""));
    assert!(listed.contains("\"device\":\"laptop\""));

    gate.shutdown().await;
}
