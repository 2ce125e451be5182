//! HTTP glue: admission middleware, the proxy handlers, admin surface, and
//! background tasks (config-change fan-out, cooldown sweep).

use crate::chat::{now_unix, ChatMessage, ChatRequest, ChatResponse, StreamChunk};
use crate::concurrency::{ConcurrencyLimiter, SlotGuard};
use crate::config::{ConfigStore, RuntimeConfig};
use crate::cooldown::CooldownTracker;
use crate::breaker::BreakerRegistry;
use crate::error::ProxyError;
use crate::fallback::FallbackEngine;
use crate::protocol::{default_registry, parse_stream, Protocol, StrategyRegistry};
use crate::rate_limit::{client_ip, extract_model, RateLimiter};
use crate::upstream::{parse_retry_after, UpstreamClient};
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const COOLDOWN_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct AppState {
    pub store: Arc<ConfigStore>,
    pub registry: Arc<StrategyRegistry>,
    pub engine: FallbackEngine,
    pub cooldowns: Arc<CooldownTracker>,
    pub breakers: Arc<BreakerRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub concurrency: Arc<ConcurrencyLimiter>,
    pub upstream: UpstreamClient,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>, ProxyError> {
        let upstream = UpstreamClient::new(&config.timeouts)?;
        let cooldowns = Arc::new(CooldownTracker::new());
        let breakers = Arc::new(BreakerRegistry::new(config.fallback.breaker.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let concurrency = Arc::new(ConcurrencyLimiter::new(&config.concurrency));
        let engine = FallbackEngine::new(
            Arc::clone(&cooldowns),
            Arc::clone(&breakers),
            Arc::clone(&concurrency),
        );
        let store = Arc::new(ConfigStore::new(config));
        Ok(Arc::new(Self {
            store,
            registry: Arc::new(default_registry()),
            engine,
            cooldowns,
            breakers,
            rate_limiter,
            concurrency,
            upstream,
            shutdown: CancellationToken::new(),
        }))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let proxied = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), admission));

    let authed = Router::new()
        .merge(proxied)
        .route("/v1/models", get(list_models))
        .route("/admin/cooldowns", get(admin_cooldowns))
        .route("/admin/breakers", get(admin_breakers))
        .route("/admin/breakers/{backend}/{model}/reset", post(admin_reset_breaker))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), require_api_key));

    Router::new()
        .merge(authed)
        .route("/healthz", get(healthz))
        .layer(middleware::from_fn(recover_panics))
        .with_state(state)
}

/// React to config-change signals and run the periodic cooldown sweep.
pub fn spawn_background_tasks(state: &Arc<AppState>) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    let reconfigure = {
        let state = Arc::clone(state);
        tokio::spawn(async move {
            let mut changes = state.store.subscribe();
            loop {
                tokio::select! {
                    _ = state.shutdown.cancelled() => return,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                let config = state.store.current();
                state.rate_limiter.reconfigure(&config.rate_limit);
                state.concurrency.reconfigure(&config.concurrency);
                state.breakers.reconfigure(config.fallback.breaker.clone());
            }
        })
    };
    handles.push(reconfigure);

    let sweep = {
        let state = Arc::clone(state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(COOLDOWN_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = state.shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let removed = state.cooldowns.cleanup();
                if removed > 0 {
                    tracing::debug!(removed, "cooldown sweep");
                }
            }
        })
    };
    handles.push(sweep);

    handles
}

fn error_response(err: &ProxyError) -> Response {
    let status =
        StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.to_envelope())).into_response()
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Recovery boundary: a panicking handler becomes a logged HTTP 500.
async fn recover_panics(request: Request, next: Next) -> Response {
    match std::panic::AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            let trimmed: String = message.chars().take(500).collect();
            tracing::error!(panic = %trimmed, "handler panicked");
            error_response(&ProxyError::internal("internal server error"))
        }
    }
}

/// Shared-key check. Accepts `Authorization: Bearer <key>` or `x-api-key`.
async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let config = state.store.current();
    if let Some(expected) = &config.proxy_api_key {
        let bearer = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let api_key =
            request.headers().get("x-api-key").and_then(|v| v.to_str().ok());
        if bearer != Some(expected.as_str()) && api_key != Some(expected.as_str()) {
            return error_response(&ProxyError::unauthorized("invalid or missing API key"));
        }
    }
    next.run(request).await
}

/// Admission gate: rate limit first, then the concurrency queue. Buffers the
/// JSON body to extract `model` and re-wraps it for the handler. An acquired
/// slot travels in the request extensions so streaming handlers can hold it
/// for the lifetime of the response body.
async fn admission(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let peer = request.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0);
    let ip = client_ip(request.headers(), peer);

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_response(&ProxyError::invalid_request(format!(
                "unreadable request body: {err}"
            )))
        }
    };
    let model = extract_model(&bytes);

    if !state.rate_limiter.allow(&ip, model.as_deref()) {
        return error_response(&ProxyError::rate_limited("rate limit exceeded"));
    }

    let slot = match state.concurrency.acquire().await {
        Ok(slot) => slot,
        Err(err) => return error_response(&err),
    };

    let mut request = Request::from_parts(parts, Body::from(bytes));
    request.extensions_mut().insert(ClientIp(ip));
    request.extensions_mut().insert(SlotExtension(Arc::new(std::sync::Mutex::new(slot))));
    next.run(request).await
}

#[derive(Clone)]
struct ClientIp(String);

/// Carrier for the admission slot. `http` extensions require `Clone`, so the
/// guard travels behind a shared cell; the handler takes it out exactly once.
#[derive(Clone)]
struct SlotExtension(Arc<std::sync::Mutex<Option<SlotGuard>>>);

fn take_slot(request: &mut Request) -> Option<SlotGuard> {
    request
        .extensions_mut()
        .remove::<SlotExtension>()
        .and_then(|ext| ext.0.lock().ok().and_then(|mut slot| slot.take()))
}

// ---------------------------------------------------------------------------
// Proxy handlers
// ---------------------------------------------------------------------------

/// A proxied upstream result, before rendering into the client wire shape.
enum Proxied {
    Unary(ChatResponse),
    Stream(BoxStream<'static, Result<StreamChunk, ProxyError>>),
}

async fn chat_completions(State(state): State<Arc<AppState>>, mut request: Request) -> Response {
    let slot = take_slot(&mut request);
    let ip = request.extensions().get::<ClientIp>().map(|ip| ip.0.clone());
    let bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_response(&ProxyError::invalid_request(format!(
                "unreadable request body: {err}"
            )))
        }
    };
    let chat_request: ChatRequest = match serde_json::from_slice(&bytes) {
        Ok(request) => request,
        Err(err) => {
            return error_response(&ProxyError::invalid_request(format!("invalid request: {err}")))
        }
    };
    let alias = chat_request.model.clone();

    match proxy_request(&state, chat_request, ip).await {
        Ok(Proxied::Unary(response)) => Json(response).into_response(),
        Ok(Proxied::Stream(chunks)) => {
            let translator = match state.registry.get(Protocol::OpenAi) {
                Ok(set) => Arc::clone(&set.stream),
                Err(err) => return error_response(&err),
            };
            let frames = chunks.map(move |item| {
                let text = match item {
                    Ok(chunk) => translator.build_data(&chunk, &alias).unwrap_or_default(),
                    Err(err) => {
                        let chunk =
                            StreamChunk { error: Some(err.message.clone()), ..StreamChunk::default() };
                        let mut text = translator.build_data(&chunk, &alias).unwrap_or_default();
                        text.push_str("data: [DONE]\n\n");
                        text
                    }
                };
                Ok::<Bytes, std::convert::Infallible>(Bytes::from(text))
            });
            sse_response(hold_slot(frames, slot))
        }
        Err(err) => error_response(&err),
    }
}

/// Legacy completions surface: prompt in, text out, same routing underneath.
async fn completions(State(state): State<Arc<AppState>>, mut request: Request) -> Response {
    let slot = take_slot(&mut request);
    let ip = request.extensions().get::<ClientIp>().map(|ip| ip.0.clone());
    let bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_response(&ProxyError::invalid_request(format!(
                "unreadable request body: {err}"
            )))
        }
    };
    let completion_request: CompletionRequest = match serde_json::from_slice(&bytes) {
        Ok(request) => request,
        Err(err) => {
            return error_response(&ProxyError::invalid_request(format!("invalid request: {err}")))
        }
    };
    let alias = completion_request.model.clone();
    let chat_request = completion_request.into_chat();

    match proxy_request(&state, chat_request, ip).await {
        Ok(Proxied::Unary(response)) => Json(completion_body(&response)).into_response(),
        Ok(Proxied::Stream(chunks)) => {
            let model = alias.clone();
            let frames = chunks.map(move |item| {
                let text = match item {
                    Ok(chunk) => completion_frame(&chunk, &model),
                    Err(err) => {
                        let frame = json!({"error": {"message": err.message}});
                        format!("data: {frame}\n\ndata: [DONE]\n\n")
                    }
                };
                Ok::<Bytes, std::convert::Infallible>(Bytes::from(text))
            });
            sse_response(hold_slot(frames, slot))
        }
        Err(err) => error_response(&err),
    }
}

/// Run one request through admission-resolved routing and translation.
async fn proxy_request(
    state: &AppState,
    base_request: ChatRequest,
    ip: Option<String>,
) -> Result<Proxied, ProxyError> {
    let config = state.store.current();
    let alias = base_request.model.clone();
    let streaming = base_request.stream;
    let system_prompt = config.proxy.rendered_system_prompt();
    let system_prompt = system_prompt.as_deref();
    let forward_ip =
        if config.proxy.forward_client_ip { ip.as_deref() } else { None };
    let cancel = state.shutdown.child_token();
    let registry = &state.registry;
    let upstream = &state.upstream;

    let outcome = state
        .engine
        .execute(&config, &alias, &cancel, |route| {
            let mut wire_request = base_request.clone();
            async move {
                let set = registry.get(route.protocol)?;
                wire_request.model = route.model.clone();
                wire_request.stream = streaming;
                let body = set.request.translate(&wire_request, system_prompt)?;
                let url = set.request.endpoint(&route.backend, &route.model, streaming);
                let mut headers = set.request.headers(&route.backend);
                if let Some(locale) = &route.backend.locale {
                    headers.push(("accept-language".to_string(), locale.clone()));
                }
                if let Some(ip) = forward_ip {
                    headers.push(("x-forwarded-for".to_string(), ip.to_string()));
                }
                tracing::debug!(
                    backend = %route.backend.name,
                    model = %route.model,
                    protocol = route.protocol.as_str(),
                    streaming,
                    "forwarding request"
                );
                let response = upstream.send(&url, &headers, &body, streaming).await?;
                let status = response.status().as_u16();
                if status >= 400 {
                    let retry_after = parse_retry_after(response.headers());
                    let body = response.bytes().await.unwrap_or_default();
                    return Err(set.error.translate(status, &body).with_retry_after(retry_after));
                }
                Ok(response)
            }
        })
        .await?;

    let set = registry.get(outcome.route.protocol)?;
    tracing::info!(
        alias = %alias,
        backend = %outcome.route.backend.name,
        model = %outcome.route.model,
        attempts = outcome.attempts,
        "request served"
    );
    if streaming {
        let reasoning = outcome.route.reasoning;
        let chunks = parse_stream(Arc::clone(&set.stream), outcome.value.bytes_stream())
            .map(move |item| {
                item.map(|mut chunk| {
                    // The reasoning channel is surfaced only when the route
                    // asked for it.
                    if !reasoning {
                        chunk.reasoning = None;
                    }
                    chunk
                })
            })
            .boxed();
        Ok(Proxied::Stream(chunks))
    } else {
        let bytes = outcome.value.bytes().await.map_err(ProxyError::from)?;
        let response = set.response.translate(&bytes, &alias)?;
        Ok(Proxied::Unary(response))
    }
}

fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, std::convert::Infallible>> + Send + 'static,
{
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Tie an admission slot's lifetime to the response body stream.
fn hold_slot<S>(stream: S, slot: Option<SlotGuard>) -> impl Stream<Item = S::Item>
where
    S: Stream,
{
    stream.map(move |item| {
        let _holding = &slot;
        item
    })
}

// ---------------------------------------------------------------------------
// Completions shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CompletionRequest {
    model: String,
    #[serde(default)]
    prompt: Value,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    stop: Option<Value>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    user: Option<String>,
}

impl CompletionRequest {
    fn prompt_text(&self) -> String {
        match &self.prompt {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }

    fn into_chat(self) -> ChatRequest {
        let prompt = self.prompt_text();
        ChatRequest {
            model: self.model,
            messages: vec![ChatMessage::new("user", prompt)],
            tools: None,
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            stop: self.stop,
            stream: self.stream,
            user: self.user,
            extra: Default::default(),
        }
    }
}

fn completion_body(response: &ChatResponse) -> Value {
    let choices: Vec<Value> = response
        .choices
        .iter()
        .map(|choice| {
            json!({
                "index": choice.index,
                "text": choice.message.text(),
                "finish_reason": choice.finish_reason,
                "logprobs": Value::Null,
            })
        })
        .collect();
    json!({
        "id": response.id,
        "object": "text_completion",
        "created": response.created,
        "model": response.model,
        "choices": choices,
        "usage": response.usage,
    })
}

fn completion_frame(chunk: &StreamChunk, model: &str) -> String {
    if chunk.content.is_none() && !chunk.finished {
        return String::new();
    }
    let frame = json!({
        "id": "cmpl-relay",
        "object": "text_completion",
        "created": now_unix(),
        "model": model,
        "choices": [{
            "index": 0,
            "text": chunk.content.clone().unwrap_or_default(),
            "finish_reason": chunk
                .stop_reason
                .filter(|_| chunk.finished)
                .map(|reason| reason.as_str()),
        }],
    });
    let mut text = format!("data: {frame}\n\n");
    if chunk.finished {
        text.push_str("data: [DONE]\n\n");
    }
    text
}

// ---------------------------------------------------------------------------
// Listing and admin surface
// ---------------------------------------------------------------------------

async fn healthz() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    let config = state.store.current();
    let mut ids: Vec<&String> =
        config.aliases.iter().filter(|(_, alias)| alias.enabled).map(|(name, _)| name).collect();
    ids.sort();
    let data: Vec<Value> = ids
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": now_unix(),
                "owned_by": "llm-relay",
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data})).into_response()
}

async fn admin_cooldowns(State(state): State<Arc<AppState>>) -> Response {
    let entries: Vec<Value> = state
        .cooldowns
        .snapshot()
        .into_iter()
        .map(|(key, remaining)| json!({"key": key, "remaining_ms": remaining.as_millis() as u64}))
        .collect();
    Json(json!({"active": entries.len(), "cooldowns": entries})).into_response()
}

async fn admin_breakers(State(state): State<Arc<AppState>>) -> Response {
    let entries: Vec<Value> = state
        .breakers
        .snapshot()
        .into_iter()
        .map(|(key, breaker_state)| json!({"key": key, "state": breaker_state.as_str()}))
        .collect();
    Json(json!({"breakers": entries})).into_response()
}

async fn admin_reset_breaker(
    State(state): State<Arc<AppState>>,
    axum::extract::Path((backend, model)): axum::extract::Path<(String, String)>,
) -> Response {
    let key = format!("{backend}/{model}");
    if state.breakers.reset(&key) {
        state.cooldowns.remove(&backend, &model);
        Json(json!({"reset": key})).into_response()
    } else {
        error_response(&ProxyError::new(
            crate::error::ErrorKind::BadRequest,
            404,
            format!("unknown breaker: {key}"),
        ))
    }
}
