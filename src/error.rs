//! Error handling and JSON error responses for the gate

use std::time::Duration;

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Unified response body type. Buffered JSON, proxied upstream bodies and
/// streamed archives all box down to this.
pub type GateBody = BoxBody<Bytes, std::io::Error>;

/// Build a buffered body from bytes.
pub fn full_body(data: impl Into<Bytes>) -> GateBody {
    Full::new(data.into()).map_err(|e| match e {}).boxed()
}

/// Build an empty body (redirects, 101 upgrade responses).
pub fn empty_body() -> GateBody {
    Empty::<Bytes>::new().map_err(|e| match e {}).boxed()
}

/// Errors that terminate request handling at the gate itself, as opposed to
/// errors the gateway produced. Every one of these maps to a JSON response
/// carrying an `X-Gate-Error` header so callers can tell the two apart.
#[derive(Debug, Clone, Error)]
pub enum GateError {
    /// No persisted gateway configuration exists yet
    #[error("Gateway is not configured")]
    NotConfigured,
    /// The gateway spawned but never answered a readiness probe
    #[error("Gateway not ready after {0} seconds")]
    StartTimeout(u64),
    /// The gateway binary could not be spawned at all
    #[error("Failed to spawn gateway: {0}")]
    SpawnFailed(String),
    /// TCP-level failure talking to a gateway that should be up
    #[error("Gateway unreachable: {0}")]
    UpstreamUnreachable(String),
    /// Per-client request budget for the admin surface is exhausted
    #[error("Too many requests")]
    RateLimited { retry_after: Duration },
    /// Too many failed auth attempts from this client
    #[error("Temporarily locked out after repeated authentication failures")]
    LockedOut { retry_after: Duration },
    /// Missing or wrong admin credentials
    #[error("Authentication required")]
    AuthRequired,
    /// Admin surface has no password configured, nothing can authenticate
    #[error("Admin password is not configured")]
    AdminDisabled,
}

impl GateError {
    /// HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            GateError::StartTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            GateError::SpawnFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            GateError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            GateError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GateError::LockedOut { .. } => StatusCode::TOO_MANY_REQUESTS,
            GateError::AuthRequired => StatusCode::UNAUTHORIZED,
            GateError::AdminDisabled => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Error code for the X-Gate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GateError::NotConfigured => "NOT_CONFIGURED",
            GateError::StartTimeout(_) => "START_TIMEOUT",
            GateError::SpawnFailed(_) => "SPAWN_FAILED",
            GateError::UpstreamUnreachable(_) => "UPSTREAM_UNREACHABLE",
            GateError::RateLimited { .. } => "RATE_LIMITED",
            GateError::LockedOut { .. } => "LOCKED_OUT",
            GateError::AuthRequired => "AUTH_REQUIRED",
            GateError::AdminDisabled => "ADMIN_DISABLED",
        }
    }

    /// Retry-After value in whole seconds, rounded up so clients never
    /// retry while still blocked.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GateError::RateLimited { retry_after } | GateError::LockedOut { retry_after } => {
                let secs = retry_after.as_secs();
                if retry_after.subsec_nanos() > 0 {
                    Some(secs + 1)
                } else {
                    Some(secs.max(1))
                }
            }
            _ => None,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: &'static str,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(error: &GateError) -> Self {
        Self {
            code: error.as_header_value(),
            message: error.to_string(),
            status: error.status_code().as_u16(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code,
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gate-Error header. Rate-limit and
/// lockout errors carry Retry-After; auth failures carry the Basic challenge.
pub fn json_error_response(error: &GateError) -> Response<GateBody> {
    let body = ErrorResponse::new(error).to_json();

    let mut builder = Response::builder()
        .status(error.status_code())
        .header("Content-Type", "application/json")
        .header("X-Gate-Error", error.as_header_value());

    if let Some(secs) = error.retry_after_secs() {
        builder = builder.header("Retry-After", secs.to_string());
    }
    if matches!(error, GateError::AuthRequired) {
        builder = builder.header("WWW-Authenticate", "Basic realm=\"gateward\"");
    }

    builder
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GateError::NotConfigured.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GateError::StartTimeout(20).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GateError::UpstreamUnreachable("connect refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GateError::AuthRequired.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GateError::RateLimited {
                retry_after: Duration::from_secs(30)
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_start_timeout_message_mentions_not_ready() {
        let message = GateError::StartTimeout(20).to_string();
        assert!(message.contains("not ready"));
    }

    #[test]
    fn test_error_response_json() {
        let error = GateError::UpstreamUnreachable("connection refused".into());
        let json = ErrorResponse::new(&error).to_json();

        assert!(json.contains("\"code\":\"UPSTREAM_UNREACHABLE\""));
        assert!(json.contains("connection refused"));
        assert!(json.contains("\"status\":502"));
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(&GateError::NotConfigured);

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Gate-Error").unwrap(),
            "NOT_CONFIGURED"
        );
        assert!(response.headers().get("Retry-After").is_none());
    }

    #[test]
    fn test_lockout_carries_retry_after() {
        let response = json_error_response(&GateError::LockedOut {
            retry_after: Duration::from_millis(90_500),
        });

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        // 90.5s rounds up to 91
        assert_eq!(response.headers().get("Retry-After").unwrap(), "91");
    }

    #[test]
    fn test_auth_required_carries_challenge() {
        let response = json_error_response(&GateError::AuthRequired);

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("WWW-Authenticate").unwrap(),
            "Basic realm=\"gateward\""
        );
    }
}
