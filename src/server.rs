use crate::admin::{self, AdminApi};
use crate::config::{Config, ADMIN_PREFIX};
use crate::error::{json_error_response, GateBody, GateError};
use crate::proxy::{self, GatewayClient};
use crate::ratelimit::RateLimiter;
use crate::supervisor::GatewaySupervisor;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// The public listener: one port serving the admin surface, the health
/// probe and the proxied gateway traffic.
pub struct GateServer {
    bind_addr: SocketAddr,
    config: Config,
    supervisor: Arc<GatewaySupervisor>,
    limiter: Arc<RateLimiter>,
    client: GatewayClient,
    admin: AdminApi,
    shutdown_rx: watch::Receiver<bool>,
}

impl GateServer {
    pub fn new(
        bind_addr: SocketAddr,
        config: Config,
        supervisor: Arc<GatewaySupervisor>,
        limiter: Arc<RateLimiter>,
        admin: AdminApi,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let client = GatewayClient::new(config.gateway_port);
        Arc::new(Self {
            bind_addr,
            config,
            supervisor,
            limiter,
            client,
            admin,
            shutdown_rx,
        })
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Gate listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.serve_connection(stream, addr).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gate shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let io = TokioIo::new(stream);
        let server = self;
        let service = service_fn(move |req: Request<Incoming>| {
            let server = Arc::clone(&server);
            async move { Ok::<_, hyper::Error>(server.handle_request(req, addr).await) }
        });

        // auto::Builder negotiates HTTP/1.1 and h2c; upgrades stay available
        // on HTTP/1.1 connections.
        AutoBuilder::new(TokioExecutor::new())
            .http1()
            .preserve_header_case(true)
            .http2()
            .max_concurrent_streams(250)
            .serve_connection_with_upgrades(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<GateBody> {
        let mut response = self.route(req, client_addr).await;
        apply_security_headers(response.headers_mut());
        response
    }

    async fn route(&self, req: Request<Incoming>, client_addr: SocketAddr) -> Response<GateBody> {
        let path = req.uri().path();

        // Health answers even while unconfigured or locked out.
        if req.method() == Method::GET && path == "/health" {
            return self.health();
        }

        if path == ADMIN_PREFIX || path.starts_with("/admin/") {
            return self.admin_gate(req, client_addr).await;
        }

        self.forward_to_gateway(req, client_addr).await
    }

    fn health(&self) -> Response<GateBody> {
        let body = serde_json::json!({
            "ok": true,
            "configured": self.supervisor.is_configured(),
            "gateway": if self.supervisor.is_running() { "running" } else { "stopped" },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        admin::json_response(StatusCode::OK, body.to_string())
    }

    /// Lockout, request rate and Basic auth, in that order. Only a request
    /// that clears all three reaches the admin handlers.
    async fn admin_gate(&self, req: Request<Incoming>, client_addr: SocketAddr) -> Response<GateBody> {
        let ip = client_addr.ip();

        if let Some(retry_after) = self.limiter.check_lockout(ip) {
            return json_error_response(&GateError::LockedOut { retry_after });
        }
        if let Some(retry_after) = self.limiter.check_request(ip) {
            return json_error_response(&GateError::RateLimited { retry_after });
        }

        let Some(expected) = self.config.admin_password.as_deref() else {
            return json_error_response(&GateError::AdminDisabled);
        };

        match basic_password(&req) {
            // A bare request is the browser asking for the challenge, not a
            // failed guess; it never counts toward the lockout.
            None => return json_error_response(&GateError::AuthRequired),
            Some(password) if password == expected => {
                self.limiter.record_auth_success(ip);
            }
            Some(_) => {
                warn!(target: "audit", client = %ip, path = req.uri().path(), "Admin authentication failed");
                if let Some(retry_after) = self.limiter.record_auth_failure(ip) {
                    return json_error_response(&GateError::LockedOut { retry_after });
                }
                return json_error_response(&GateError::AuthRequired);
            }
        }

        self.admin.handle(req).await
    }

    async fn forward_to_gateway(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<GateBody> {
        if !self.supervisor.is_configured() {
            return admin::redirect_to_setup();
        }

        if let Err(e) = self.supervisor.ensure_running().await {
            warn!(error = %e, "Gateway unavailable for proxied request");
            return json_error_response(&e);
        }

        if proxy::is_upgrade_request(&req) {
            return proxy::handle_upgrade(req, self.client.port(), client_addr).await;
        }

        match self.client.forward(req, client_addr).await {
            Ok(response) => response,
            Err(e) => json_error_response(&e),
        }
    }
}

/// Extract the password from a Basic Authorization header. The username is
/// not checked, only the password identifies the operator.
fn basic_password<B>(req: &Request<B>) -> Option<String> {
    let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded =
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (_user, password) = decoded.split_once(':')?;
    Some(password.to_string())
}

fn apply_security_headers(headers: &mut HeaderMap) {
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.insert("cache-control", HeaderValue::from_static("no-store"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_auth(value: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("/admin/status");
        if let Some(v) = value {
            builder = builder.header(AUTHORIZATION, v);
        }
        builder.body(()).unwrap()
    }

    fn encode_basic(credentials: &str) -> String {
        format!(
            "Basic {}",
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, credentials)
        )
    }

    #[test]
    fn test_basic_password_extraction() {
        let req = request_with_auth(Some(&encode_basic("admin:secret")));
        assert_eq!(basic_password(&req), Some("secret".to_string()));

        // Any username is accepted
        let req = request_with_auth(Some(&encode_basic("whoever:secret")));
        assert_eq!(basic_password(&req), Some("secret".to_string()));

        // Colons inside the password survive
        let req = request_with_auth(Some(&encode_basic("op:pa:ss")));
        assert_eq!(basic_password(&req), Some("pa:ss".to_string()));
    }

    #[test]
    fn test_basic_password_rejects_malformed() {
        assert_eq!(basic_password(&request_with_auth(None)), None);
        assert_eq!(
            basic_password(&request_with_auth(Some("Bearer token123"))),
            None
        );
        assert_eq!(
            basic_password(&request_with_auth(Some("Basic not!base64!!"))),
            None
        );

        // Decodes but has no colon separator
        let no_colon = format!(
            "Basic {}",
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, "justapassword")
        );
        assert_eq!(basic_password(&request_with_auth(Some(&no_colon))), None);
    }

    #[test]
    fn test_security_headers_applied_and_overwritten() {
        let mut headers = HeaderMap::new();
        headers.insert("cache-control", HeaderValue::from_static("max-age=3600"));

        apply_security_headers(&mut headers);

        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(headers.get("referrer-policy").unwrap(), "no-referrer");
        assert_eq!(headers.get("cache-control").unwrap(), "no-store");
        assert_eq!(headers.get_all("cache-control").iter().count(), 1);
    }
}
