//! Azure OpenAI error vocabulary.
//!
//! Azure rides the OpenAI request/response/stream path (see
//! [`super::openai::OpenAiStrategy::azure`]) but discriminates errors by
//! `code` rather than `type`, and defines `content_filter` as a terminal
//! kind.

use crate::error::{ErrorKind, ProxyError};
use crate::protocol::openai::body_snippet;
use crate::protocol::{ErrorTranslator, Protocol};
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct AzureErrorTranslator;

impl AzureErrorTranslator {
    pub fn new() -> Self {
        Self
    }
}

impl ErrorTranslator for AzureErrorTranslator {
    fn protocol(&self) -> Protocol {
        Protocol::Azure
    }

    fn name(&self) -> &'static str {
        "azure"
    }

    fn translate(&self, status: u16, body: &[u8]) -> ProxyError {
        let parsed: Option<Value> = serde_json::from_slice(body).ok();
        let message = parsed
            .as_ref()
            .and_then(|v| v["error"]["message"].as_str())
            .map(str::to_string)
            .unwrap_or_else(|| body_snippet(body, status));
        let code = parsed
            .as_ref()
            .and_then(|v| v["error"]["code"].as_str())
            .unwrap_or("")
            .to_string();

        let mut err = ProxyError::from_status(status, message).with_provider("azure");
        match code.as_str() {
            // Azure content filtering is terminal at any status.
            "content_filter" | "ResponsibleAIPolicyViolation" => {
                err.kind = ErrorKind::InvalidRequest;
                err.retryable = false;
            }
            code if code.starts_with("rate_limit") || code == "429" => {
                err.kind = ErrorKind::RateLimited;
                err.retryable = true;
            }
            _ => {}
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminates_by_code_field() {
        let translator = AzureErrorTranslator::new();
        let body = br#"{"error":{"code":"rate_limit_exceeded","message":"busy"}}"#;
        let err = translator.translate(429, body);
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert!(err.retryable);
        assert_eq!(err.provider.as_deref(), Some("azure"));
    }

    #[test]
    fn content_filter_is_terminal_even_on_server_status() {
        let translator = AzureErrorTranslator::new();
        let body = br#"{"error":{"code":"content_filter","message":"filtered"}}"#;
        let err = translator.translate(400, body);
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
        assert!(!err.retryable);

        // Even if Azure reports it under a 5xx, it must not be retried.
        let err = translator.translate(500, body);
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
        assert!(!err.retryable);
    }

    #[test]
    fn unknown_codes_fall_back_to_status_table() {
        let translator = AzureErrorTranslator::new();
        let body = br#"{"error":{"code":"DeploymentNotFound","message":"no such deployment"}}"#;
        let err = translator.translate(404, body);
        assert_eq!(err.kind, ErrorKind::BadRequest);
        assert!(!err.retryable);

        let err = translator.translate(503, b"");
        assert_eq!(err.kind, ErrorKind::BackendError);
        assert!(err.retryable);
    }
}
