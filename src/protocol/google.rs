//! Google Vertex AI / Gemini dialect (`generateContent` REST shape).

use crate::chat::{now_unix, ChatChoice, ChatMessage, ChatRequest, ChatResponse, StopReason, StreamChunk, Usage};
use crate::error::{ErrorKind, ProxyError};
use crate::protocol::openai::body_snippet;
use crate::protocol::{
    ErrorTranslator, Protocol, RequestTranslator, ResponseTranslator, StreamTranslator,
};
use crate::routes::Backend;
use serde_json::{json, Value};

#[derive(Debug, Clone, Default)]
pub struct GoogleStrategy;

impl GoogleStrategy {
    pub fn new() -> Self {
        Self
    }

    /// Split canonical messages into `systemInstruction` text and the
    /// `contents` array. Gemini uses `model` for the assistant role and
    /// function responses ride as `functionResponse` parts.
    fn format_contents(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
        let mut system_parts: Vec<String> = Vec::new();
        let mut contents = Vec::new();

        for msg in messages {
            match msg.role.as_str() {
                "system" => system_parts.push(msg.text()),
                "tool" => {
                    let name = msg.name.clone().or_else(|| msg.tool_call_id.clone()).unwrap_or_default();
                    contents.push(json!({
                        "role": "user",
                        "parts": [{
                            "functionResponse": {
                                "name": name,
                                "response": {"content": msg.text()},
                            }
                        }],
                    }));
                }
                "assistant" => {
                    let mut parts: Vec<Value> = Vec::new();
                    let text = msg.text();
                    if !text.is_empty() {
                        parts.push(json!({"text": text}));
                    }
                    if let Some(calls) = msg.tool_calls.as_ref().and_then(Value::as_array) {
                        for call in calls {
                            let args: Value = call["function"]["arguments"]
                                .as_str()
                                .and_then(|a| serde_json::from_str(a).ok())
                                .unwrap_or_else(|| json!({}));
                            parts.push(json!({
                                "functionCall": {"name": call["function"]["name"], "args": args}
                            }));
                        }
                    }
                    contents.push(json!({"role": "model", "parts": parts}));
                }
                _ => contents.push(json!({
                    "role": "user",
                    "parts": [{"text": msg.text()}],
                })),
            }
        }

        let system = if system_parts.is_empty() { None } else { Some(system_parts.join("\n\n")) };
        (system, contents)
    }

    fn map_finish_reason(reason: &str) -> StopReason {
        match reason {
            "MAX_TOKENS" => StopReason::Length,
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => {
                StopReason::ContentFilter
            }
            _ => StopReason::Stop,
        }
    }

    fn unmap_finish_reason(reason: StopReason) -> &'static str {
        match reason {
            StopReason::Length => "MAX_TOKENS",
            StopReason::ContentFilter => "SAFETY",
            StopReason::Stop | StopReason::ToolCalls => "STOP",
        }
    }

    /// Pull content text, reasoning text, tool calls, and the finish reason
    /// out of one `candidates[0]` value.
    fn read_candidate(candidate: &Value) -> (String, String, Vec<Value>, Option<StopReason>) {
        let mut text = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::new();
        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                if let Some(t) = part["text"].as_str() {
                    if part["thought"].as_bool().unwrap_or(false) {
                        reasoning.push_str(t);
                    } else {
                        text.push_str(t);
                    }
                } else if part.get("functionCall").is_some() {
                    tool_calls.push(json!({
                        "id": format!("call-{}", tool_calls.len()),
                        "type": "function",
                        "function": {
                            "name": part["functionCall"]["name"],
                            "arguments": part["functionCall"]["args"].to_string(),
                        },
                    }));
                }
            }
        }
        let stop_reason = candidate["finishReason"].as_str().map(Self::map_finish_reason);
        (text, reasoning, tool_calls, stop_reason)
    }
}

impl RequestTranslator for GoogleStrategy {
    fn protocol(&self) -> Protocol {
        Protocol::Google
    }

    fn name(&self) -> &'static str {
        "google"
    }

    fn translate(
        &self,
        request: &ChatRequest,
        system_prompt: Option<&str>,
    ) -> Result<Value, ProxyError> {
        let (client_system, contents) = Self::format_contents(&request.messages);
        if contents.is_empty() {
            return Err(ProxyError::invalid_request("messages must not be empty"));
        }
        let mut body = json!({"contents": contents});

        let system = match (system_prompt, client_system) {
            (Some(injected), Some(client)) => Some(format!("{injected}\n\n{client}")),
            (Some(injected), None) => Some(injected.to_string()),
            (None, client) => client,
        };
        if let Some(system) = system {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }

        let mut generation = serde_json::Map::new();
        if let Some(temperature) = request.temperature {
            generation.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            generation.insert("topP".into(), json!(top_p));
        }
        if let Some(max_tokens) = request.max_tokens {
            generation.insert("maxOutputTokens".into(), json!(max_tokens));
        }
        if let Some(stop) = &request.stop {
            let sequences = match stop {
                Value::String(s) => json!([s]),
                other => other.clone(),
            };
            generation.insert("stopSequences".into(), sequences);
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }

        if let Some(tools) = request.tools.as_ref().and_then(Value::as_array) {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t["function"]["name"],
                        "description": t["function"]["description"],
                        "parameters": t["function"]["parameters"],
                    })
                })
                .collect();
            body["tools"] = json!([{"functionDeclarations": declarations}]);
        }
        Ok(body)
    }

    fn endpoint(&self, backend: &Backend, model: &str, stream: bool) -> String {
        let base = backend.url.trim_end_matches('/');
        if stream {
            format!("{base}/v1beta/models/{model}:streamGenerateContent?alt=sse")
        } else {
            format!("{base}/v1beta/models/{model}:generateContent")
        }
    }

    fn headers(&self, backend: &Backend) -> Vec<(String, String)> {
        match &backend.api_key {
            Some(key) => vec![("x-goog-api-key".to_string(), key.clone())],
            None => Vec::new(),
        }
    }
}

impl ResponseTranslator for GoogleStrategy {
    fn protocol(&self) -> Protocol {
        Protocol::Google
    }

    fn name(&self) -> &'static str {
        "google"
    }

    fn translate(&self, body: &[u8], model: &str) -> Result<ChatResponse, ProxyError> {
        let value: Value = serde_json::from_slice(body).map_err(|err| {
            ProxyError::new(
                ErrorKind::BackendError,
                502,
                format!("malformed upstream response: {err}"),
            )
            .with_provider("google")
        })?;
        let candidate = value["candidates"].get(0).cloned().unwrap_or_else(|| json!({}));
        let (text, _reasoning, tool_calls, stop_reason) = Self::read_candidate(&candidate);

        let usage = value.get("usageMetadata").map(|u| {
            let prompt = u["promptTokenCount"].as_u64().unwrap_or(0);
            let completion = u["candidatesTokenCount"].as_u64().unwrap_or(0);
            let total = u["totalTokenCount"].as_u64().unwrap_or(prompt + completion);
            Usage { prompt_tokens: prompt, completion_tokens: completion, total_tokens: total }
        });

        let message = ChatMessage {
            role: "assistant".to_string(),
            content: Some(Value::String(text)),
            name: None,
            tool_calls: if tool_calls.is_empty() { None } else { Some(Value::Array(tool_calls)) },
            tool_call_id: None,
        };
        let finish_reason = stop_reason.map(|r| r.as_str().to_string());
        Ok(ChatResponse {
            id: format!("gen-{}", now_unix()),
            object: "chat.completion".to_string(),
            created: now_unix(),
            model: model.to_string(),
            choices: vec![ChatChoice { index: 0, message, finish_reason }],
            usage,
            extra: Default::default(),
        })
    }
}

impl StreamTranslator for GoogleStrategy {
    fn protocol(&self) -> Protocol {
        Protocol::Google
    }

    fn name(&self) -> &'static str {
        "google"
    }

    fn parse_data(&self, data: &str) -> Result<Option<StreamChunk>, ProxyError> {
        let value: Value = serde_json::from_str(data).map_err(|err| {
            ProxyError::new(ErrorKind::BackendError, 502, format!("malformed stream frame: {err}"))
                .with_provider("google")
        })?;
        let Some(candidate) = value["candidates"].get(0) else {
            return Ok(None);
        };
        let (text, reasoning, tool_calls, stop_reason) = Self::read_candidate(candidate);
        let chunk = StreamChunk {
            content: if text.is_empty() { None } else { Some(text) },
            reasoning: if reasoning.is_empty() { None } else { Some(reasoning) },
            tool_calls: if tool_calls.is_empty() { None } else { Some(Value::Array(tool_calls)) },
            finished: stop_reason.is_some(),
            stop_reason,
            ..StreamChunk::default()
        };
        Ok(Some(chunk).filter(|c| !c.is_empty()))
    }

    fn build_data(&self, chunk: &StreamChunk, _model: &str) -> Result<String, ProxyError> {
        if let Some(error) = &chunk.error {
            let frame = json!({"error": {"message": error, "status": "INTERNAL"}});
            return Ok(format!("data: {frame}\n\n"));
        }
        let mut parts: Vec<Value> = Vec::new();
        if let Some(content) = &chunk.content {
            parts.push(json!({"text": content}));
        }
        if let Some(reasoning) = &chunk.reasoning {
            parts.push(json!({"text": reasoning, "thought": true}));
        }
        let mut candidate = json!({"content": {"role": "model", "parts": parts}});
        if chunk.finished {
            candidate["finishReason"] =
                json!(Self::unmap_finish_reason(chunk.stop_reason.unwrap_or(StopReason::Stop)));
        }
        let frame = json!({"candidates": [candidate]});
        Ok(format!("data: {frame}\n\n"))
    }
}

impl ErrorTranslator for GoogleStrategy {
    fn protocol(&self) -> Protocol {
        Protocol::Google
    }

    fn name(&self) -> &'static str {
        "google"
    }

    fn translate(&self, status: u16, body: &[u8]) -> ProxyError {
        let parsed: Option<Value> = serde_json::from_slice(body).ok();
        let message = parsed
            .as_ref()
            .and_then(|v| v["error"]["message"].as_str())
            .map(str::to_string)
            .unwrap_or_else(|| body_snippet(body, status));
        let kind_override = parsed
            .as_ref()
            .and_then(|v| v["error"]["status"].as_str())
            .and_then(|s| match s {
                "INVALID_ARGUMENT" => Some((ErrorKind::InvalidRequest, false)),
                "UNAUTHENTICATED" => Some((ErrorKind::Unauthorized, false)),
                "PERMISSION_DENIED" | "NOT_FOUND" | "FAILED_PRECONDITION" => {
                    Some((ErrorKind::BadRequest, false))
                }
                "RESOURCE_EXHAUSTED" => Some((ErrorKind::RateLimited, true)),
                "UNAVAILABLE" | "INTERNAL" | "DEADLINE_EXCEEDED" => {
                    Some((ErrorKind::BackendError, true))
                }
                _ => None,
            });
        let mut err = ProxyError::from_status(status, message).with_provider("google");
        if let Some((kind, retryable)) = kind_override {
            err.kind = kind;
            err.retryable = retryable;
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> ChatRequest {
        serde_json::from_value(json!({
            "model": "gemini-pro",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
                {"role": "user", "content": "more"},
            ],
            "temperature": 0.4,
            "max_tokens": 256,
        }))
        .unwrap()
    }

    #[test]
    fn request_maps_roles_and_generation_config() {
        let strategy = GoogleStrategy::new();
        let body = RequestTranslator::translate(&strategy, &request(), None).unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be terse");
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(body["generationConfig"]["temperature"], 0.4);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 256);
    }

    #[test]
    fn endpoint_switches_on_stream() {
        let strategy = GoogleStrategy::new();
        let backend = Backend {
            name: "g".into(),
            url: "https://generativelanguage.googleapis.com".into(),
            api_key: Some("gk".into()),
            enabled: true,
            protocol: Protocol::Google,
            locale: None,
        };
        assert!(strategy
            .endpoint(&backend, "gemini-pro", false)
            .ends_with("/v1beta/models/gemini-pro:generateContent"));
        assert!(strategy
            .endpoint(&backend, "gemini-pro", true)
            .ends_with(":streamGenerateContent?alt=sse"));
        assert_eq!(
            strategy.headers(&backend),
            vec![("x-goog-api-key".to_string(), "gk".to_string())]
        );
    }

    #[test]
    fn response_concatenates_parts_and_maps_usage() {
        let strategy = GoogleStrategy::new();
        let body = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Hi "}, {"text": "there"}]},
                "finishReason": "STOP",
            }],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 6, "totalTokenCount": 10},
        });
        let resp = ResponseTranslator::translate(
            &strategy,
            serde_json::to_vec(&body).unwrap().as_slice(),
            "gemini-alias",
        )
        .unwrap();
        assert_eq!(resp.model, "gemini-alias");
        assert_eq!(resp.choices[0].message.text(), "Hi there");
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.usage.as_ref().unwrap().total_tokens, 10);
    }

    #[test]
    fn safety_finish_maps_to_content_filter() {
        let strategy = GoogleStrategy::new();
        let body = json!({
            "candidates": [{"content": {"parts": []}, "finishReason": "SAFETY"}],
        });
        let resp = ResponseTranslator::translate(
            &strategy,
            serde_json::to_vec(&body).unwrap().as_slice(),
            "m",
        )
        .unwrap();
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("content_filter"));
    }

    #[test]
    fn stream_frame_with_text_parses() {
        let strategy = GoogleStrategy::new();
        let chunk = strategy
            .parse_data(r#"{"candidates":[{"content":{"parts":[{"text":"Hi"}]}}]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.content.as_deref(), Some("Hi"));
        assert!(!chunk.finished);
    }

    #[test]
    fn stream_thought_parts_become_reasoning() {
        let strategy = GoogleStrategy::new();
        let chunk = strategy
            .parse_data(r#"{"candidates":[{"content":{"parts":[{"text":"mull","thought":true}]}}]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.reasoning.as_deref(), Some("mull"));
        assert!(chunk.content.is_none());
    }

    #[test]
    fn stream_finish_reason_terminates() {
        let strategy = GoogleStrategy::new();
        let chunk = strategy
            .parse_data(r#"{"candidates":[{"content":{"parts":[{"text":"bye"}]},"finishReason":"MAX_TOKENS"}]}"#)
            .unwrap()
            .unwrap();
        assert!(chunk.finished);
        assert_eq!(chunk.stop_reason, Some(StopReason::Length));
        assert_eq!(chunk.content.as_deref(), Some("bye"));
    }

    #[test]
    fn build_then_parse_roundtrips() {
        let strategy = GoogleStrategy::new();
        for chunk in [
            StreamChunk::content("hello"),
            StreamChunk::reasoning("thinking"),
            StreamChunk::finished(StopReason::Stop),
            StreamChunk::finished(StopReason::Length),
            StreamChunk::finished(StopReason::ContentFilter),
        ] {
            let framed = strategy.build_data(&chunk, "gemini").unwrap();
            let payload = framed.strip_prefix("data: ").unwrap().trim();
            assert_eq!(strategy.parse_data(payload).unwrap().unwrap(), chunk);
        }
    }

    #[test]
    fn error_status_field_table() {
        let strategy = GoogleStrategy::new();
        let body = br#"{"error":{"code":429,"message":"quota","status":"RESOURCE_EXHAUSTED"}}"#;
        let err = ErrorTranslator::translate(&strategy, 429, body);
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert!(err.retryable);

        let body = br#"{"error":{"code":400,"message":"bad","status":"INVALID_ARGUMENT"}}"#;
        let err = ErrorTranslator::translate(&strategy, 400, body);
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
        assert!(!err.retryable);

        let body = br#"{"error":{"code":503,"message":"down","status":"UNAVAILABLE"}}"#;
        let err = ErrorTranslator::translate(&strategy, 503, body);
        assert_eq!(err.kind, ErrorKind::BackendError);
        assert!(err.retryable);
    }

    #[test]
    fn empty_error_body_uses_status_mapping() {
        let strategy = GoogleStrategy::new();
        let err = ErrorTranslator::translate(&strategy, 500, b"");
        assert_eq!(err.kind, ErrorKind::BackendError);
        assert!(err.retryable);
        assert_eq!(err.provider.as_deref(), Some("google"));
    }
}
