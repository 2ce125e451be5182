//! Canonical chat entities.
//!
//! The proxy speaks the OpenAI chat dialect to its clients, so these types
//! mirror that wire shape. Unknown fields are preserved through `extra` maps
//! and flow to the backend untouched when the backend speaks the same
//! dialect.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// One message in a chat conversation. `content` is either a plain string or
/// an array of content blocks, so it stays an opaque `Value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(Value::String(content.into())),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Flatten the content into plain text. Block arrays contribute their
    /// `text` parts; non-text blocks are skipped.
    pub fn text(&self) -> String {
        match &self.content {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(blocks)) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }
}

/// Inbound chat-completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Unary chat-completion response in the client dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default = "chat_completion_object")]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn chat_completion_object() -> String {
    "chat.completion".to_string()
}

/// Canonical stop reason carried by terminal stream chunks and mapped onto
/// every dialect's finish-marker vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Stop => "stop",
            StopReason::Length => "length",
            StopReason::ContentFilter => "content_filter",
            StopReason::ToolCalls => "tool_calls",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stop" => Some(StopReason::Stop),
            "length" => Some(StopReason::Length),
            "content_filter" => Some(StopReason::ContentFilter),
            "tool_calls" => Some(StopReason::ToolCalls),
            _ => None,
        }
    }
}

/// One canonical streaming delta. A stream is a finite sequence of chunks;
/// the terminal chunk has `finished = true`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunk {
    pub role: Option<String>,
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub tool_calls: Option<Value>,
    pub finished: bool,
    pub stop_reason: Option<StopReason>,
    pub error: Option<String>,
}

impl StreamChunk {
    pub fn content(text: impl Into<String>) -> Self {
        Self { content: Some(text.into()), ..Self::default() }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self { reasoning: Some(text.into()), ..Self::default() }
    }

    pub fn role(role: impl Into<String>) -> Self {
        Self { role: Some(role.into()), ..Self::default() }
    }

    pub fn finished(stop_reason: StopReason) -> Self {
        Self { finished: true, stop_reason: Some(stop_reason), ..Self::default() }
    }

    /// True when the chunk carries nothing worth forwarding.
    pub fn is_empty(&self) -> bool {
        self.role.is_none()
            && self.content.is_none()
            && self.reasoning.is_none()
            && self.tool_calls.is_none()
            && !self.finished
            && self.error.is_none()
    }
}

/// Seconds since the Unix epoch, for `created` stamps on translated responses.
pub fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_roundtrip_preserves_unknown_fields() {
        let body = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2,
            "stream": true,
            "logit_bias": {"50256": -100},
        });
        let req: ChatRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.model, "gpt-4");
        assert_eq!(req.messages.len(), 1);
        assert!(req.stream);
        assert_eq!(req.extra["logit_bias"]["50256"], -100);

        let out = serde_json::to_value(&req).unwrap();
        assert_eq!(out["logit_bias"]["50256"], -100);
    }

    #[test]
    fn message_text_flattens_blocks() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "a"},
                {"type": "image_url", "image_url": {"url": "http://x"}},
                {"type": "text", "text": "b"},
            ],
        }))
        .unwrap();
        assert_eq!(msg.text(), "ab");
    }

    #[test]
    fn message_text_plain_string() {
        let msg = ChatMessage::new("user", "hello");
        assert_eq!(msg.text(), "hello");
    }

    #[test]
    fn stop_reason_labels_roundtrip() {
        for reason in [
            StopReason::Stop,
            StopReason::Length,
            StopReason::ContentFilter,
            StopReason::ToolCalls,
        ] {
            assert_eq!(StopReason::parse(reason.as_str()), Some(reason));
        }
        assert_eq!(StopReason::parse("end_turn"), None);
    }

    #[test]
    fn chunk_emptiness() {
        assert!(StreamChunk::default().is_empty());
        assert!(!StreamChunk::content("x").is_empty());
        assert!(!StreamChunk::finished(StopReason::Stop).is_empty());
    }

    #[test]
    fn response_defaults_fill_in() {
        let resp: ChatResponse = serde_json::from_value(json!({
            "model": "m",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}}],
        }))
        .unwrap();
        assert_eq!(resp.object, "chat.completion");
        assert_eq!(resp.choices[0].message.text(), "ok");
    }
}
