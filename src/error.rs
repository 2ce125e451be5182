//! Domain errors shared by routing, admission control, and dialect translation.

use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

/// User-visible error taxonomy. Every provider dialect maps its own error
/// vocabulary onto this space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidRequest,
    Unauthorized,
    RateLimited,
    BackendError,
    BadRequest,
    Unknown,
}

impl ErrorKind {
    /// Stable label used in the wire envelope's `type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request_error",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::BackendError => "backend_error",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// Error surfaced by the proxy core.
///
/// `retryable` is the centralized retryability classification: the fallback
/// engine consults it (possibly adjusted by the `error_fallback`
/// configuration) to decide whether a failed candidate may be retried on the
/// next one. `retry_after` carries an upstream `Retry-After` hint when one
/// was present.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProxyError {
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
    pub provider: Option<String>,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
}

impl ProxyError {
    pub fn new(kind: ErrorKind, status: u16, message: impl Into<String>) -> Self {
        let retryable = matches!(kind, ErrorKind::RateLimited | ErrorKind::BackendError);
        Self { kind, status, message: message.into(), provider: None, retryable, retry_after: None }
    }

    /// Classify a bare HTTP status into `(kind, retryable)`.
    ///
    /// Client-terminal statuses (400/401/403/404/422) are never retryable;
    /// 429 and 5xx are. Anything else is `Unknown` and terminal.
    pub fn classify_status(status: u16) -> (ErrorKind, bool) {
        match status {
            400 => (ErrorKind::InvalidRequest, false),
            401 => (ErrorKind::Unauthorized, false),
            403 | 404 | 422 => (ErrorKind::BadRequest, false),
            429 => (ErrorKind::RateLimited, true),
            500..=599 => (ErrorKind::BackendError, true),
            _ => (ErrorKind::Unknown, false),
        }
    }

    /// Build an error from a bare HTTP status, applying the status table.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let (kind, retryable) = Self::classify_status(status);
        Self { kind, status, message: message.into(), provider: None, retryable, retry_after: None }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, 400, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, 401, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::RateLimited, 429, message);
        // Admission rejections are surfaced to the client, never retried internally.
        err.retryable = false;
        err
    }

    /// Alias lookup failure: surfaced as a 404-equivalent bad request.
    pub fn alias_not_found(alias: &str) -> Self {
        Self::new(ErrorKind::BadRequest, 404, format!("unknown model alias: {alias}"))
    }

    /// Transport-level failure (connect, TLS, timeout). Always retryable.
    pub fn network(message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::BackendError, 502, message);
        err.retryable = true;
        err
    }

    /// Concurrency queue is at capacity.
    pub fn queue_overflow() -> Self {
        let mut err = Self::new(ErrorKind::BackendError, 503, "request queue is full");
        err.retryable = false;
        err
    }

    /// Timed out waiting for an in-flight slot.
    pub fn queue_timeout(waited: Duration) -> Self {
        let mut err = Self::new(
            ErrorKind::BackendError,
            503,
            format!("timed out after {waited:?} waiting for capacity"),
        );
        err.retryable = false;
        err
    }

    /// Request cancelled by the client or by shutdown.
    pub fn cancelled() -> Self {
        let mut err = Self::new(ErrorKind::Unknown, 499, "request cancelled");
        err.retryable = false;
        err
    }

    /// Internal invariant violation surfaced at the recovery boundary.
    pub fn internal(message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::Unknown, 500, message);
        err.retryable = false;
        err
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// The well-known JSON envelope returned to clients.
    pub fn to_envelope(&self) -> Value {
        let mut error = json!({
            "message": self.message,
            "type": self.kind.as_str(),
            "code": self.status,
        });
        if let Some(provider) = &self.provider {
            error["provider"] = json!(provider);
        }
        json!({ "error": error })
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::network(format!("upstream request timed out: {err}"))
        } else if err.is_connect() {
            ProxyError::network(format!("failed to connect to upstream: {err}"))
        } else {
            ProxyError::network(format!("upstream transport error: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_client_terminal_statuses() {
        for status in [400u16, 401, 403, 404, 422] {
            let (_, retryable) = ProxyError::classify_status(status);
            assert!(!retryable, "status {status} must be terminal");
        }
    }

    #[test]
    fn classify_retryable_statuses() {
        for status in [429u16, 500, 502, 503, 504] {
            let (_, retryable) = ProxyError::classify_status(status);
            assert!(retryable, "status {status} must be retryable");
        }
    }

    #[test]
    fn classify_kind_table() {
        assert_eq!(ProxyError::classify_status(400).0, ErrorKind::InvalidRequest);
        assert_eq!(ProxyError::classify_status(401).0, ErrorKind::Unauthorized);
        assert_eq!(ProxyError::classify_status(403).0, ErrorKind::BadRequest);
        assert_eq!(ProxyError::classify_status(404).0, ErrorKind::BadRequest);
        assert_eq!(ProxyError::classify_status(429).0, ErrorKind::RateLimited);
        assert_eq!(ProxyError::classify_status(503).0, ErrorKind::BackendError);
        assert_eq!(ProxyError::classify_status(418).0, ErrorKind::Unknown);
    }

    #[test]
    fn admission_rejections_are_not_retryable() {
        assert!(!ProxyError::rate_limited("slow down").retryable);
        assert!(!ProxyError::queue_overflow().retryable);
        assert!(!ProxyError::queue_timeout(Duration::from_millis(50)).retryable);
    }

    #[test]
    fn network_errors_are_retryable() {
        assert!(ProxyError::network("connection refused").retryable);
    }

    #[test]
    fn envelope_shape() {
        let err = ProxyError::from_status(429, "rate limit exceeded").with_provider("openai");
        let envelope = err.to_envelope();
        assert_eq!(envelope["error"]["message"], "rate limit exceeded");
        assert_eq!(envelope["error"]["type"], "rate_limited");
        assert_eq!(envelope["error"]["code"], 429);
        assert_eq!(envelope["error"]["provider"], "openai");
    }

    #[test]
    fn alias_not_found_is_404_bad_request() {
        let err = ProxyError::alias_not_found("gpt-9");
        assert_eq!(err.status, 404);
        assert_eq!(err.kind, ErrorKind::BadRequest);
        assert!(!err.retryable);
        assert!(err.message.contains("gpt-9"));
    }

    #[test]
    fn display_is_the_message() {
        let err = ProxyError::invalid_request("missing field: model");
        assert_eq!(err.to_string(), "missing field: model");
    }
}
