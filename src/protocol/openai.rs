//! OpenAI chat-completions dialect.
//!
//! One strategy covers two flavors: plain OpenAI (also the wire format of
//! DeepSeek, Groq, Mistral, and Cohere endpoints) and Azure OpenAI, which
//! shares the request/response/stream shapes but differs in endpoint layout
//! and auth header. Azure's error vocabulary is handled by
//! [`super::azure::AzureErrorTranslator`].

use crate::chat::{now_unix, ChatRequest, ChatResponse, StopReason, StreamChunk};
use crate::error::{ErrorKind, ProxyError};
use crate::protocol::{
    ErrorTranslator, Protocol, RequestTranslator, ResponseTranslator, StreamTranslator,
};
use crate::routes::Backend;
use serde_json::{json, Map, Value};

const AZURE_API_VERSION: &str = "2024-02-15-preview";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    OpenAi,
    Azure,
}

#[derive(Debug, Clone)]
pub struct OpenAiStrategy {
    flavor: Flavor,
}

impl OpenAiStrategy {
    pub fn openai() -> Self {
        Self { flavor: Flavor::OpenAi }
    }

    pub fn azure() -> Self {
        Self { flavor: Flavor::Azure }
    }

    fn label(&self) -> &'static str {
        match self.flavor {
            Flavor::OpenAi => "openai",
            Flavor::Azure => "azure",
        }
    }

    fn tag(&self) -> Protocol {
        match self.flavor {
            Flavor::OpenAi => Protocol::OpenAi,
            Flavor::Azure => Protocol::Azure,
        }
    }
}

/// Short, printable excerpt of an upstream body for error messages.
pub(crate) fn body_snippet(body: &[u8], status: u16) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        format!("upstream returned status {status}")
    } else {
        text.chars().take(200).collect()
    }
}

impl RequestTranslator for OpenAiStrategy {
    fn protocol(&self) -> Protocol {
        self.tag()
    }

    fn name(&self) -> &'static str {
        self.label()
    }

    fn translate(
        &self,
        request: &ChatRequest,
        system_prompt: Option<&str>,
    ) -> Result<Value, ProxyError> {
        let mut body = serde_json::to_value(request)
            .map_err(|err| ProxyError::internal(format!("request serialization failed: {err}")))?;
        if let Some(prompt) = system_prompt {
            // The client's own system message wins over the injected one.
            let has_system = request.messages.iter().any(|m| m.role == "system");
            if !has_system {
                if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
                    messages.insert(0, json!({"role": "system", "content": prompt}));
                }
            }
        }
        Ok(body)
    }

    fn endpoint(&self, backend: &Backend, model: &str, _stream: bool) -> String {
        let base = backend.url.trim_end_matches('/');
        match self.flavor {
            Flavor::OpenAi => {
                if base.ends_with("/v1") {
                    format!("{base}/chat/completions")
                } else {
                    format!("{base}/v1/chat/completions")
                }
            }
            Flavor::Azure => format!(
                "{base}/openai/deployments/{model}/chat/completions?api-version={AZURE_API_VERSION}"
            ),
        }
    }

    fn headers(&self, backend: &Backend) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(key) = &backend.api_key {
            match self.flavor {
                Flavor::OpenAi => headers.push(("authorization".into(), format!("Bearer {key}"))),
                Flavor::Azure => headers.push(("api-key".into(), key.clone())),
            }
        }
        headers
    }
}

impl ResponseTranslator for OpenAiStrategy {
    fn protocol(&self) -> Protocol {
        self.tag()
    }

    fn name(&self) -> &'static str {
        self.label()
    }

    fn translate(&self, body: &[u8], model: &str) -> Result<ChatResponse, ProxyError> {
        let mut response: ChatResponse = serde_json::from_slice(body).map_err(|err| {
            ProxyError::new(
                ErrorKind::BackendError,
                502,
                format!("malformed upstream response: {err}"),
            )
            .with_provider(self.label())
        })?;
        response.model = model.to_string();
        Ok(response)
    }
}

impl StreamTranslator for OpenAiStrategy {
    fn protocol(&self) -> Protocol {
        self.tag()
    }

    fn name(&self) -> &'static str {
        self.label()
    }

    fn parse_data(&self, data: &str) -> Result<Option<StreamChunk>, ProxyError> {
        let value: Value = serde_json::from_str(data).map_err(|err| {
            ProxyError::new(ErrorKind::BackendError, 502, format!("malformed stream frame: {err}"))
                .with_provider(self.label())
        })?;
        let Some(choice) = value.get("choices").and_then(|c| c.get(0)) else {
            return Ok(None);
        };
        let delta = choice.get("delta").cloned().unwrap_or_else(|| json!({}));
        let mut chunk = StreamChunk {
            role: delta.get("role").and_then(Value::as_str).map(str::to_string),
            content: delta
                .get("content")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            reasoning: delta
                .get("reasoning_content")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            tool_calls: delta.get("tool_calls").cloned(),
            ..StreamChunk::default()
        };
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            chunk.finished = true;
            chunk.stop_reason = Some(StopReason::parse(reason).unwrap_or(StopReason::Stop));
        }
        if chunk.is_empty() {
            Ok(None)
        } else {
            Ok(Some(chunk))
        }
    }

    fn build_data(&self, chunk: &StreamChunk, model: &str) -> Result<String, ProxyError> {
        if let Some(error) = &chunk.error {
            let frame = json!({"error": {"message": error, "type": "backend_error"}});
            return Ok(format!("data: {frame}\n\n"));
        }
        let mut delta = Map::new();
        if let Some(role) = &chunk.role {
            delta.insert("role".into(), json!(role));
        }
        if let Some(content) = &chunk.content {
            delta.insert("content".into(), json!(content));
        }
        if let Some(reasoning) = &chunk.reasoning {
            delta.insert("reasoning_content".into(), json!(reasoning));
        }
        if let Some(tool_calls) = &chunk.tool_calls {
            delta.insert("tool_calls".into(), tool_calls.clone());
        }
        let finish_reason = if chunk.finished {
            json!(chunk.stop_reason.unwrap_or(StopReason::Stop).as_str())
        } else {
            Value::Null
        };
        let frame = json!({
            "id": "chatcmpl-relay",
            "object": "chat.completion.chunk",
            "created": now_unix(),
            "model": model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
        });
        let mut out = format!("data: {frame}\n\n");
        if chunk.finished {
            out.push_str("data: [DONE]\n\n");
        }
        Ok(out)
    }
}

impl ErrorTranslator for OpenAiStrategy {
    fn protocol(&self) -> Protocol {
        self.tag()
    }

    fn name(&self) -> &'static str {
        self.label()
    }

    fn translate(&self, status: u16, body: &[u8]) -> ProxyError {
        let parsed: Option<Value> = serde_json::from_slice(body).ok();
        let message = parsed
            .as_ref()
            .and_then(|v| v["error"]["message"].as_str())
            .map(str::to_string)
            .unwrap_or_else(|| body_snippet(body, status));
        let mut err = ProxyError::from_status(status, message).with_provider(self.label());
        let code = parsed
            .as_ref()
            .and_then(|v| v["error"]["type"].as_str().or_else(|| v["error"]["code"].as_str()))
            .unwrap_or("");
        if code.starts_with("rate_limit") {
            err.kind = ErrorKind::RateLimited;
            err.retryable = true;
        }
        err
    }
}
