//! Domain error types for voicegate.
//!
//! Typed errors at module boundaries replace string-encoded errors and
//! enable structured handling: transient downstream failures feed the
//! retry/fallback path, input errors stay session-local, and fatal
//! session errors route through the single teardown path.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Downstream errors
// ---------------------------------------------------------------------------

/// Errors from downstream service calls (STT, LLM, TTS, external).
///
/// Embedded in `anyhow::Error` so the adapter trait signatures
/// (`-> anyhow::Result<...>`) stay uniform while callers can downcast:
/// `e.downcast_ref::<DownstreamError>()`.
#[derive(Debug, Error)]
pub enum DownstreamError {
    #[error("Request timed out after {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    #[error("HTTP error (status {status}): {message}")]
    Http { status: u16, message: String },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to parse response: {0}")]
    InvalidResponse(String),
}

impl DownstreamError {
    /// Whether this failure is worth retrying on the same instance.
    pub fn is_transient(&self) -> bool {
        match self {
            DownstreamError::Timeout { .. } => true,
            DownstreamError::ConnectionReset(_) => true,
            DownstreamError::Unavailable(_) => true,
            DownstreamError::Http { status, .. } => *status >= 500 || *status == 429,
            DownstreamError::InvalidResponse(_) => false,
        }
    }

    /// Whether the pool's underlying client should be rebuilt after this.
    pub fn breaks_transport(&self) -> bool {
        matches!(self, DownstreamError::ConnectionReset(_))
    }
}

/// Classify a `reqwest` error into a [`DownstreamError`].
pub fn classify_http_error(err: reqwest::Error) -> DownstreamError {
    if err.is_timeout() {
        return DownstreamError::Timeout { waited_ms: 0 };
    }
    if err.is_connect() {
        return DownstreamError::Unavailable(err.to_string());
    }
    if let Some(status) = err.status() {
        return DownstreamError::Http {
            status: status.as_u16(),
            message: err.to_string(),
        };
    }
    // Mid-body resets and closed keepalive connections land here.
    DownstreamError::ConnectionReset(err.to_string())
}

// ---------------------------------------------------------------------------
// Session errors
// ---------------------------------------------------------------------------

/// Errors from session registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session already exists: {0}")]
    Duplicate(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already ended: {0}")]
    Ended(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downstream_error_display() {
        let e = DownstreamError::Timeout { waited_ms: 5000 };
        assert_eq!(e.to_string(), "Request timed out after 5000ms");
    }

    #[test]
    fn test_timeout_is_transient() {
        assert!(DownstreamError::Timeout { waited_ms: 100 }.is_transient());
    }

    #[test]
    fn test_server_error_is_transient() {
        let e = DownstreamError::Http { status: 503, message: "overloaded".into() };
        assert!(e.is_transient());
    }

    #[test]
    fn test_rate_limit_is_transient() {
        let e = DownstreamError::Http { status: 429, message: "slow down".into() };
        assert!(e.is_transient());
    }

    #[test]
    fn test_client_error_is_not_transient() {
        let e = DownstreamError::Http { status: 400, message: "bad request".into() };
        assert!(!e.is_transient());
    }

    #[test]
    fn test_invalid_response_is_not_transient() {
        assert!(!DownstreamError::InvalidResponse("garbage".into()).is_transient());
    }

    #[test]
    fn test_reset_breaks_transport() {
        assert!(DownstreamError::ConnectionReset("eof".into()).breaks_transport());
        assert!(!DownstreamError::Timeout { waited_ms: 1 }.breaks_transport());
    }

    #[test]
    fn test_downstream_error_downcast() {
        let anyhow_err: anyhow::Error = DownstreamError::Unavailable("no route".into()).into();
        let downcasted = anyhow_err.downcast_ref::<DownstreamError>();
        assert!(matches!(downcasted, Some(DownstreamError::Unavailable(_))));
    }

    #[test]
    fn test_session_error_display() {
        let e = SessionError::Duplicate("call-1".into());
        assert_eq!(e.to_string(), "Session already exists: call-1");
    }
}
