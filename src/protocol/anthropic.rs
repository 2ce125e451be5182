//! Anthropic Messages dialect.

use crate::chat::{now_unix, ChatChoice, ChatMessage, ChatRequest, ChatResponse, StopReason, StreamChunk, Usage};
use crate::error::{ErrorKind, ProxyError};
use crate::protocol::openai::body_snippet;
use crate::protocol::{
    ErrorTranslator, Protocol, RequestTranslator, ResponseTranslator, StreamTranslator,
};
use crate::routes::Backend;
use serde_json::{json, Value};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Default)]
pub struct AnthropicStrategy;

impl AnthropicStrategy {
    pub fn new() -> Self {
        Self
    }

    /// Split canonical messages into the `system` string and the Anthropic
    /// message array. Tool results ride as `tool_result` user blocks;
    /// assistant tool calls become `tool_use` blocks.
    fn format_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
        let mut system_parts: Vec<String> = Vec::new();
        let mut formatted = Vec::new();

        for msg in messages {
            match msg.role.as_str() {
                "system" => system_parts.push(msg.text()),
                "tool" => {
                    if let Some(id) = &msg.tool_call_id {
                        formatted.push(json!({
                            "role": "user",
                            "content": [{
                                "type": "tool_result",
                                "tool_use_id": id,
                                "content": msg.text(),
                            }],
                        }));
                    }
                }
                "assistant" if msg.tool_calls.is_some() => {
                    let mut blocks: Vec<Value> = Vec::new();
                    let text = msg.text();
                    if !text.is_empty() {
                        blocks.push(json!({"type": "text", "text": text}));
                    }
                    if let Some(calls) = msg.tool_calls.as_ref().and_then(Value::as_array) {
                        for call in calls {
                            let arguments = call["function"]["arguments"].as_str().unwrap_or("{}");
                            let input: Value =
                                serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
                            blocks.push(json!({
                                "type": "tool_use",
                                "id": call["id"],
                                "name": call["function"]["name"],
                                "input": input,
                            }));
                        }
                    }
                    formatted.push(json!({"role": "assistant", "content": blocks}));
                }
                role => {
                    let role = if role == "assistant" { "assistant" } else { "user" };
                    formatted.push(json!({"role": role, "content": msg.content.clone().unwrap_or(Value::String(String::new()))}));
                }
            }
        }

        let system = if system_parts.is_empty() { None } else { Some(system_parts.join("\n\n")) };
        (system, formatted)
    }

    fn format_tools(tools: &Value) -> Value {
        let Some(list) = tools.as_array() else { return json!([]) };
        Value::Array(
            list.iter()
                .map(|t| {
                    json!({
                        "name": t["function"]["name"],
                        "description": t["function"]["description"],
                        "input_schema": t["function"]["parameters"],
                    })
                })
                .collect(),
        )
    }

    fn map_stop_reason(reason: &str) -> StopReason {
        match reason {
            "max_tokens" => StopReason::Length,
            "tool_use" => StopReason::ToolCalls,
            "refusal" => StopReason::ContentFilter,
            // end_turn, stop_sequence, and anything novel.
            _ => StopReason::Stop,
        }
    }

    fn unmap_stop_reason(reason: StopReason) -> &'static str {
        match reason {
            StopReason::Stop => "end_turn",
            StopReason::Length => "max_tokens",
            StopReason::ToolCalls => "tool_use",
            StopReason::ContentFilter => "refusal",
        }
    }
}

impl RequestTranslator for AnthropicStrategy {
    fn protocol(&self) -> Protocol {
        Protocol::Anthropic
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn translate(
        &self,
        request: &ChatRequest,
        system_prompt: Option<&str>,
    ) -> Result<Value, ProxyError> {
        let (client_system, messages) = Self::format_messages(&request.messages);
        if messages.is_empty() {
            return Err(ProxyError::invalid_request("messages must not be empty"));
        }
        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": request.stream,
        });
        // Injected prompt first, then the client's own system content.
        let system = match (system_prompt, client_system) {
            (Some(injected), Some(client)) => Some(format!("{injected}\n\n{client}")),
            (Some(injected), None) => Some(injected.to_string()),
            (None, client) => client,
        };
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(stop) = &request.stop {
            body["stop_sequences"] = match stop {
                Value::String(s) => json!([s]),
                other => other.clone(),
            };
        }
        if let Some(tools) = &request.tools {
            body["tools"] = Self::format_tools(tools);
        }
        Ok(body)
    }

    fn endpoint(&self, backend: &Backend, _model: &str, _stream: bool) -> String {
        format!("{}/v1/messages", backend.url.trim_end_matches('/'))
    }

    fn headers(&self, backend: &Backend) -> Vec<(String, String)> {
        let mut headers = vec![("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string())];
        if let Some(key) = &backend.api_key {
            headers.push(("x-api-key".to_string(), key.clone()));
        }
        headers
    }
}

impl ResponseTranslator for AnthropicStrategy {
    fn protocol(&self) -> Protocol {
        Protocol::Anthropic
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn translate(&self, body: &[u8], model: &str) -> Result<ChatResponse, ProxyError> {
        let value: Value = serde_json::from_slice(body).map_err(|err| {
            ProxyError::new(
                ErrorKind::BackendError,
                502,
                format!("malformed upstream response: {err}"),
            )
            .with_provider("anthropic")
        })?;

        let mut text = String::new();
        let mut tool_calls: Vec<Value> = Vec::new();
        if let Some(blocks) = value["content"].as_array() {
            for block in blocks {
                match block["type"].as_str() {
                    Some("text") => text.push_str(block["text"].as_str().unwrap_or("")),
                    Some("tool_use") => tool_calls.push(json!({
                        "id": block["id"],
                        "type": "function",
                        "function": {
                            "name": block["name"],
                            "arguments": block["input"].to_string(),
                        },
                    })),
                    _ => {}
                }
            }
        }

        let finish_reason = value["stop_reason"]
            .as_str()
            .map(|r| Self::map_stop_reason(r).as_str().to_string());
        let usage = value.get("usage").map(|u| {
            let prompt = u["input_tokens"].as_u64().unwrap_or(0);
            let completion = u["output_tokens"].as_u64().unwrap_or(0);
            Usage { prompt_tokens: prompt, completion_tokens: completion, total_tokens: prompt + completion }
        });

        let message = ChatMessage {
            role: "assistant".to_string(),
            content: Some(Value::String(text)),
            name: None,
            tool_calls: if tool_calls.is_empty() { None } else { Some(Value::Array(tool_calls)) },
            tool_call_id: None,
        };
        Ok(ChatResponse {
            id: value["id"].as_str().unwrap_or("msg-relay").to_string(),
            object: "chat.completion".to_string(),
            created: now_unix(),
            model: model.to_string(),
            choices: vec![ChatChoice { index: 0, message, finish_reason }],
            usage,
            extra: Default::default(),
        })
    }
}

impl StreamTranslator for AnthropicStrategy {
    fn protocol(&self) -> Protocol {
        Protocol::Anthropic
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn parse_data(&self, data: &str) -> Result<Option<StreamChunk>, ProxyError> {
        let value: Value = serde_json::from_str(data).map_err(|err| {
            ProxyError::new(ErrorKind::BackendError, 502, format!("malformed stream frame: {err}"))
                .with_provider("anthropic")
        })?;
        let chunk = match value["type"].as_str() {
            Some("message_start") => Some(StreamChunk::role(
                value["message"]["role"].as_str().unwrap_or("assistant"),
            )),
            Some("content_block_start") => {
                let block = &value["content_block"];
                if block["type"] == "tool_use" {
                    let index = value["index"].as_u64().unwrap_or(0);
                    Some(StreamChunk {
                        tool_calls: Some(json!([{
                            "index": index,
                            "id": block["id"],
                            "type": "function",
                            "function": {"name": block["name"], "arguments": ""},
                        }])),
                        ..StreamChunk::default()
                    })
                } else {
                    None
                }
            }
            Some("content_block_delta") => {
                let delta = &value["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        delta["text"].as_str().map(StreamChunk::content)
                    }
                    Some("thinking_delta") => {
                        delta["thinking"].as_str().map(StreamChunk::reasoning)
                    }
                    Some("input_json_delta") => {
                        let index = value["index"].as_u64().unwrap_or(0);
                        delta["partial_json"].as_str().map(|args| StreamChunk {
                            tool_calls: Some(json!([{
                                "index": index,
                                "function": {"arguments": args},
                            }])),
                            ..StreamChunk::default()
                        })
                    }
                    _ => None,
                }
            }
            Some("message_delta") => value["delta"]["stop_reason"]
                .as_str()
                .map(|reason| StreamChunk::finished(Self::map_stop_reason(reason))),
            Some("error") => Some(StreamChunk {
                error: Some(
                    value["error"]["message"].as_str().unwrap_or("upstream error").to_string(),
                ),
                ..StreamChunk::default()
            }),
            // message_stop, ping, content_block_stop.
            _ => None,
        };
        Ok(chunk.filter(|c| !c.is_empty()))
    }

    fn build_data(&self, chunk: &StreamChunk, _model: &str) -> Result<String, ProxyError> {
        if let Some(error) = &chunk.error {
            let frame = json!({"type": "error", "error": {"type": "api_error", "message": error}});
            return Ok(format!("event: error\ndata: {frame}\n\n"));
        }
        let mut out = String::new();
        if let Some(role) = &chunk.role {
            let frame = json!({"type": "message_start", "message": {"role": role, "content": []}});
            out.push_str(&format!("event: message_start\ndata: {frame}\n\n"));
        }
        if let Some(content) = &chunk.content {
            let frame = json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": content},
            });
            out.push_str(&format!("event: content_block_delta\ndata: {frame}\n\n"));
        }
        if let Some(reasoning) = &chunk.reasoning {
            let frame = json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "thinking_delta", "thinking": reasoning},
            });
            out.push_str(&format!("event: content_block_delta\ndata: {frame}\n\n"));
        }
        if chunk.finished {
            let reason = Self::unmap_stop_reason(chunk.stop_reason.unwrap_or(StopReason::Stop));
            let frame = json!({"type": "message_delta", "delta": {"stop_reason": reason}});
            out.push_str(&format!("event: message_delta\ndata: {frame}\n\n"));
            out.push_str(&format!("event: message_stop\ndata: {}\n\n", json!({"type": "message_stop"})));
        }
        Ok(out)
    }
}

impl ErrorTranslator for AnthropicStrategy {
    fn protocol(&self) -> Protocol {
        Protocol::Anthropic
    }

    fn name(&self) -> &'static str {
        "anthropic"
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
            .and_then(|v| v["error"]["type"].as_str())
            .and_then(|t| match t {
                "invalid_request_error" => Some((ErrorKind::InvalidRequest, false)),
                "authentication_error" => Some((ErrorKind::Unauthorized, false)),
                "permission_error" | "not_found_error" => Some((ErrorKind::BadRequest, false)),
                "rate_limit_error" => Some((ErrorKind::RateLimited, true)),
                "overloaded_error" | "api_error" => Some((ErrorKind::BackendError, true)),
                _ => None,
            });
        let mut err = ProxyError::from_status(status, message).with_provider("anthropic");
        if let Some((kind, retryable)) = kind_override {
            err.kind = kind;
            err.retryable = retryable;
        }
        err
    }
}
