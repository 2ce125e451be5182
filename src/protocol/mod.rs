//! Provider dialect translation.
//!
//! Each dialect supplies four strategies — request, response, stream-chunk,
//! and error translation — bundled in a [`StrategySet`] and dispatched by
//! [`Protocol`] tag through the [`StrategyRegistry`]. Adding a provider means
//! implementing the four traits and registering a set; nothing else changes.

use crate::chat::{ChatRequest, ChatResponse, StopReason, StreamChunk};
use crate::error::ProxyError;
use crate::routes::Backend;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub mod anthropic;
pub mod azure;
pub mod google;
pub mod openai;
pub mod sse;

pub use anthropic::AnthropicStrategy;
pub use azure::AzureErrorTranslator;
pub use google::GoogleStrategy;
pub use openai::OpenAiStrategy;
pub use sse::SseDecoder;

/// Wire format family of a backend.
///
/// Providers that speak the OpenAI dialect under their own brand (DeepSeek,
/// Groq, Mistral, Cohere) are accepted as tag aliases and collapse to
/// `OpenAi` at parse time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    #[serde(alias = "deepseek", alias = "groq", alias = "mistral", alias = "cohere")]
    OpenAi,
    Anthropic,
    Azure,
    Google,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::OpenAi => "openai",
            Protocol::Anthropic => "anthropic",
            Protocol::Azure => "azure",
            Protocol::Google => "google",
        }
    }
}

/// Translate a canonical request into a backend wire body, plus the
/// endpoint and headers that go with it.
pub trait RequestTranslator: Send + Sync {
    fn protocol(&self) -> Protocol;
    fn name(&self) -> &'static str;
    fn supports(&self, protocol: Protocol) -> bool {
        protocol == self.protocol()
    }
    /// `request.model` has already been rewritten to the backend model.
    fn translate(
        &self,
        request: &ChatRequest,
        system_prompt: Option<&str>,
    ) -> Result<Value, ProxyError>;
    fn endpoint(&self, backend: &Backend, model: &str, stream: bool) -> String;
    fn headers(&self, backend: &Backend) -> Vec<(String, String)>;
}

/// Translate a unary backend response body into the client dialect.
pub trait ResponseTranslator: Send + Sync {
    fn protocol(&self) -> Protocol;
    fn name(&self) -> &'static str;
    fn supports(&self, protocol: Protocol) -> bool {
        protocol == self.protocol()
    }
    /// `model` is the client-visible model name stamped on the result.
    fn translate(&self, body: &[u8], model: &str) -> Result<ChatResponse, ProxyError>;
}

/// Translate between provider stream framing and canonical chunks.
pub trait StreamTranslator: Send + Sync {
    fn protocol(&self) -> Protocol;
    fn name(&self) -> &'static str;
    fn supports(&self, protocol: Protocol) -> bool {
        protocol == self.protocol()
    }
    /// Parse one SSE data payload. `Ok(None)` for frames that carry nothing
    /// canonical (pings, structural markers).
    fn parse_data(&self, data: &str) -> Result<Option<StreamChunk>, ProxyError>;
    /// Serialize one canonical chunk into this dialect's framing, including
    /// the dialect's terminal marker when `chunk.finished`. Empty string
    /// means "emit nothing".
    fn build_data(&self, chunk: &StreamChunk, model: &str) -> Result<String, ProxyError>;
}

/// Map a provider error body onto the proxy taxonomy.
pub trait ErrorTranslator: Send + Sync {
    fn protocol(&self) -> Protocol;
    fn name(&self) -> &'static str;
    fn supports(&self, protocol: Protocol) -> bool {
        protocol == self.protocol()
    }
    fn translate(&self, status: u16, body: &[u8]) -> ProxyError;
}

/// One dialect's full strategy bundle.
#[derive(Clone)]
pub struct StrategySet {
    pub request: Arc<dyn RequestTranslator>,
    pub response: Arc<dyn ResponseTranslator>,
    pub stream: Arc<dyn StreamTranslator>,
    pub error: Arc<dyn ErrorTranslator>,
}

impl std::fmt::Debug for StrategySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategySet")
            .field("request", &self.request.name())
            .field("response", &self.response.name())
            .field("stream", &self.stream.name())
            .field("error", &self.error.name())
            .finish()
    }
}

impl StrategySet {
    /// Build a set from a single strategy implementing all four contracts.
    pub fn uniform<T>(strategy: Arc<T>) -> Self
    where
        T: RequestTranslator + ResponseTranslator + StreamTranslator + ErrorTranslator + 'static,
    {
        Self {
            request: Arc::clone(&strategy) as Arc<dyn RequestTranslator>,
            response: Arc::clone(&strategy) as Arc<dyn ResponseTranslator>,
            stream: Arc::clone(&strategy) as Arc<dyn StreamTranslator>,
            error: strategy as Arc<dyn ErrorTranslator>,
        }
    }

    pub fn with_error(mut self, error: Arc<dyn ErrorTranslator>) -> Self {
        self.error = error;
        self
    }
}

/// Dispatch table keyed by protocol tag.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    sets: HashMap<Protocol, StrategySet>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, protocol: Protocol, set: StrategySet) {
        self.sets.insert(protocol, set);
    }

    pub fn get(&self, protocol: Protocol) -> Result<&StrategySet, ProxyError> {
        self.sets.get(&protocol).ok_or_else(|| {
            ProxyError::internal(format!("no strategy registered for protocol {}", protocol.as_str()))
        })
    }

    pub fn protocols(&self) -> Vec<Protocol> {
        let mut protocols: Vec<Protocol> = self.sets.keys().copied().collect();
        protocols.sort_by_key(|p| p.as_str());
        protocols
    }
}

/// The default wiring: OpenAI, Anthropic, Google Vertex, and Azure (the
/// OpenAI request/response/stream path under an Azure flavor, with the
/// Azure-specific error translator layered on top).
pub fn default_registry() -> StrategyRegistry {
    let mut registry = StrategyRegistry::new();
    registry.register(Protocol::OpenAi, StrategySet::uniform(Arc::new(OpenAiStrategy::openai())));
    registry.register(Protocol::Anthropic, StrategySet::uniform(Arc::new(AnthropicStrategy::new())));
    registry.register(Protocol::Google, StrategySet::uniform(Arc::new(GoogleStrategy::new())));
    registry.register(
        Protocol::Azure,
        StrategySet::uniform(Arc::new(OpenAiStrategy::azure()))
            .with_error(Arc::new(AzureErrorTranslator::new())),
    );
    registry
}

/// Pump a provider byte stream through the SSE decoder and the dialect's
/// chunk parser, yielding a finite canonical sequence whose last chunk has
/// `finished = true`.
pub fn parse_stream<S>(
    translator: Arc<dyn StreamTranslator>,
    body: S,
) -> impl Stream<Item = Result<StreamChunk, ProxyError>> + Send
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    async_stream::stream! {
        let mut decoder = SseDecoder::new();
        let mut finished = false;
        futures::pin_mut!(body);
        while let Some(next) = body.next().await {
            let bytes = match next {
                Ok(bytes) => bytes,
                Err(err) => {
                    yield Err(ProxyError::from(err));
                    return;
                }
            };
            for data in decoder.feed(&bytes) {
                if data == "[DONE]" {
                    finished = true;
                    continue;
                }
                match translator.parse_data(&data) {
                    Ok(Some(chunk)) => {
                        finished |= chunk.finished;
                        yield Ok(chunk);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }
        }
        for data in decoder.flush() {
            if data == "[DONE]" {
                finished = true;
                continue;
            }
            if let Ok(Some(chunk)) = translator.parse_data(&data) {
                finished |= chunk.finished;
                yield Ok(chunk);
            }
        }
        if !finished {
            yield Ok(StreamChunk::finished(StopReason::Stop));
        }
    }
}
