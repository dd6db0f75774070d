use crate::error::{empty_body, json_error_response, GateBody, GateError};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Pooled HTTP client for the loopback gateway.
///
/// Keeps idle connections to the single upstream alive so that bursts of
/// proxied requests do not pay the connect cost each time.
pub struct GatewayClient {
    client: Client<HttpConnector, Incoming>,
    port: u16,
}

impl GatewayClient {
    pub fn new(port: u16) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Self { client, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Forward a request verbatim to the gateway and stream the response back.
    ///
    /// The request URI is rewritten to the loopback gateway port; method,
    /// headers and body pass through unchanged apart from the forwarding
    /// headers, which are always overwritten with observed values.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<GateBody>, GateError> {
        let request_id = request_id(&req);

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://127.0.0.1:{}{}", self.port, path_and_query);

        let (mut parts, body) = req.into_parts();
        set_forwarding_headers(&mut parts.headers, client_addr, &request_id);

        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (name, value) in parts.headers.iter() {
            builder = builder.header(name, value);
        }
        let gateway_req = builder.body(body).map_err(|e| {
            error!(error = %e, "Failed to rebuild request for forwarding");
            GateError::UpstreamUnreachable("request rebuild failed".to_string())
        })?;

        debug!(request_id, uri = %uri, "Forwarding request to gateway");

        let response = self.client.request(gateway_req).await.map_err(|e| {
            // Log detailed error internally, return generic message externally
            error!(port = self.port, request_id, error = %e, "Failed to forward request to gateway");
            GateError::UpstreamUnreachable("connection failed".to_string())
        })?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(
            parts,
            body.map_err(std::io::Error::other).boxed(),
        ))
    }
}

/// Generate a new request ID, or propagate the caller's if one is present.
fn request_id<B>(req: &Request<B>) -> String {
    req.headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Stamp the forwarding headers with observed values.
///
/// Client-supplied values are overwritten, never appended: the gateway must
/// only ever see the address and host this process observed.
fn set_forwarding_headers(headers: &mut HeaderMap, client_addr: SocketAddr, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    // Check for Connection: Upgrade header (case-insensitive value check)
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    // Check for Upgrade header present
    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Get the value of the Upgrade header
fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// Build the raw HTTP upgrade request to send to the gateway
fn build_upgrade_request<B>(req: &Request<B>, port: u16) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    // Forward all headers except Host, which is rewritten to the gateway
    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: 127.0.0.1:{}\r\n", port));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the HTTP response from the gateway to check for 101 Switching Protocols
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Parse status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    // Parse headers
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Handle a WebSocket/HTTP upgrade request against the gateway.
///
/// The handshake is relayed over a dedicated TCP connection; once the
/// gateway answers 101 the two streams are joined and bytes flow both ways
/// until either side closes.
pub async fn handle_upgrade(
    mut req: Request<Incoming>,
    port: u16,
    client_addr: SocketAddr,
) -> Response<GateBody> {
    let request_id = request_id(&req);
    set_forwarding_headers(req.headers_mut(), client_addr, &request_id);

    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
    debug!(request_id, upgrade_type, "Handling upgrade request");

    // Build the raw HTTP request to send to the gateway
    let raw_request = build_upgrade_request(&req, port);

    // Connect to the gateway
    let gateway_addr = format!("127.0.0.1:{}", port);
    let mut gateway_stream = match TcpStream::connect(&gateway_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(port, request_id, error = %e, "Failed to connect to gateway for upgrade");
            return json_error_response(&GateError::UpstreamUnreachable(
                "connection failed".to_string(),
            ));
        }
    };

    // Send the upgrade request to the gateway
    if let Err(e) = gateway_stream.write_all(&raw_request).await {
        error!(request_id, error = %e, "Failed to send upgrade request to gateway");
        return json_error_response(&GateError::UpstreamUnreachable(
            "connection failed".to_string(),
        ));
    }

    // Read the gateway's response
    let mut response_buf = vec![0u8; 4096];
    let n = match gateway_stream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            error!(request_id, "Gateway closed connection before responding to upgrade");
            return json_error_response(&GateError::UpstreamUnreachable(
                "gateway closed connection".to_string(),
            ));
        }
        Err(e) => {
            error!(request_id, error = %e, "Failed to read upgrade response from gateway");
            return json_error_response(&GateError::UpstreamUnreachable(
                "connection failed".to_string(),
            ));
        }
    };

    // Parse the gateway's response
    let (status, response_headers) = match parse_upgrade_response(&response_buf[..n]) {
        Some(parsed) => parsed,
        None => {
            error!(request_id, "Failed to parse gateway upgrade response");
            return json_error_response(&GateError::UpstreamUnreachable(
                "invalid upgrade response".to_string(),
            ));
        }
    };

    // Check if the gateway accepted the upgrade
    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(request_id, status = %status, "Gateway rejected upgrade request");
        // Return the gateway's non-101 response as-is
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return response
            .body(empty_body())
            .expect("valid response builder");
    }

    info!(request_id, upgrade_type, "WebSocket upgrade established");

    // Build the 101 response to send to the client
    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        // Skip framing headers that hyper handles
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let response = response
        .body(empty_body())
        .expect("valid response builder");

    // Spawn the bidirectional forwarding task
    tokio::spawn(async move {
        // Wait for the client upgrade to complete
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(request_id, "Client upgrade complete, starting forwarding");
                forward_bidirectional(upgraded, gateway_stream, &request_id).await;
            }
            Err(e) => {
                error!(request_id, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    response
}

/// Forward bytes bidirectionally between the client and gateway connections
async fn forward_bidirectional(client: Upgraded, gateway: TcpStream, request_id: &str) {
    let mut client_io = TokioIo::new(client);
    let mut gateway_io = gateway;

    match tokio::io::copy_bidirectional(&mut client_io, &mut gateway_io).await {
        Ok((client_to_gateway, gateway_to_client)) => {
            debug!(
                request_id,
                client_to_gateway, gateway_to_client, "WebSocket connection closed normally"
            );
        }
        Err(e) => {
            debug!(request_id, error = %e, "WebSocket connection closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_headers(headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().uri("/ws");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_upgrade_detection_requires_both_headers() {
        let req = request_with_headers(&[("connection", "Upgrade"), ("upgrade", "websocket")]);
        assert!(is_upgrade_request(&req));

        let req = request_with_headers(&[("connection", "keep-alive, Upgrade"), ("upgrade", "websocket")]);
        assert!(is_upgrade_request(&req));

        let req = request_with_headers(&[("connection", "upgrade")]);
        assert!(!is_upgrade_request(&req));

        let req = request_with_headers(&[("upgrade", "websocket")]);
        assert!(!is_upgrade_request(&req));

        let req = request_with_headers(&[("connection", "keep-alive")]);
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn test_upgrade_type_is_lowercased() {
        let req = request_with_headers(&[("upgrade", "WebSocket")]);
        assert_eq!(get_upgrade_type(&req), Some("websocket".to_string()));

        let req = request_with_headers(&[]);
        assert_eq!(get_upgrade_type(&req), None);
    }

    #[test]
    fn test_build_upgrade_request_rewrites_host() {
        let req = Request::builder()
            .method("GET")
            .uri("/ws?session=1")
            .header("host", "example.com")
            .header("sec-websocket-key", "dGhlIHNhbXBsZQ==")
            .body(())
            .unwrap();

        let raw = build_upgrade_request(&req, 9400);
        let text = String::from_utf8(raw).unwrap();

        assert!(text.starts_with("GET /ws?session=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: 127.0.0.1:9400\r\n"));
        assert!(text.contains("sec-websocket-key: dGhlIHNhbXBsZQ==\r\n"));
        assert!(!text.contains("example.com"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_upgrade_response_accepts_101() {
        let data = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";
        let (status, headers) = parse_upgrade_response(data).unwrap();

        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(headers
            .iter()
            .any(|(name, value)| name == "Upgrade" && value == "websocket"));
        assert!(headers
            .iter()
            .any(|(name, _)| name == "Sec-WebSocket-Accept"));
    }

    #[test]
    fn test_parse_upgrade_response_keeps_rejection_status() {
        let data = b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n";
        let (status, _) = parse_upgrade_response(data).unwrap();
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_parse_upgrade_response_rejects_garbage() {
        assert!(parse_upgrade_response(b"not an http response").is_none());
        assert!(parse_upgrade_response(b"").is_none());
        assert!(parse_upgrade_response(&[0xff, 0xfe, 0x00]).is_none());
    }

    #[test]
    fn test_forwarding_headers_are_overwritten() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("8.8.8.8"));
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
        headers.insert(hyper::header::HOST, HeaderValue::from_static("gate.local"));

        let addr: SocketAddr = "10.1.2.3:55555".parse().unwrap();
        set_forwarding_headers(&mut headers, addr, "req-1");

        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "10.1.2.3");
        assert_eq!(headers.get_all(X_FORWARDED_FOR).iter().count(), 1);
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "http");
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "gate.local");
        assert_eq!(headers.get(X_REQUEST_ID).unwrap(), "req-1");
    }

    #[test]
    fn test_request_id_propagated_or_minted() {
        let req = request_with_headers(&[("x-request-id", "abc-123")]);
        assert_eq!(request_id(&req), "abc-123");

        let req = request_with_headers(&[]);
        let minted = request_id(&req);
        assert!(Uuid::parse_str(&minted).is_ok());
    }

    #[test]
    fn test_client_creation() {
        let client = GatewayClient::new(9400);
        assert_eq!(client.port(), 9400);
    }
}
