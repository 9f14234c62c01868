use hyper::StatusCode;
use thiserror::Error;

/// Process exit codes. `0` is normal shutdown.
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_STARTUP: i32 = 3;

/// Everything that can go wrong while handling a request.
///
/// `PolicyBlock` is intentionally absent: a policy hit is not an error, it
/// is a synthesized reply (`Outcome::ReplyNow`).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no route for request: {0}")]
    Route(String),

    #[error("upstream authentication failed: {0}")]
    Auth(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("redaction failed: {0}")]
    Redaction(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status delivered to the client for this error kind.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Route(_) => StatusCode::BAD_REQUEST,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            // A failed redact step must never fail open: the request is
            // aborted before any byte reaches the upstream.
            GatewayError::Upstream(_) | GatewayError::Redaction(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Internal(format!("json: {e}"))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.status().map(|s| s == 401 || s == 403).unwrap_or(false) {
            GatewayError::Auth(e.to_string())
        } else {
            GatewayError::Upstream(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_errors_are_client_errors() {
        assert_eq!(
            GatewayError::Route("no mux rule matches".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn redaction_failure_never_fails_open() {
        assert_eq!(
            GatewayError::Redaction("detector panicked".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
