#![forbid(unsafe_code)]

//! # llm-relay
//!
//! Reverse proxy for LLM chat APIs. Clients name a *model alias*; the proxy
//! resolves it to a ranked list of candidate backends speaking different
//! provider dialects (OpenAI, Anthropic, Azure OpenAI, Google Vertex AI),
//! picks a healthy one, translates the request into that backend's wire
//! format, forwards it (streaming or unary), and translates the response
//! back. Failed candidates are cooled down and retried on fallbacks with
//! exponential backoff.
//!
//! ## Pieces
//!
//! - **Routing & fallback**: [`routes`], [`balancer`], [`cooldown`],
//!   [`breaker`], [`backoff`], [`fallback`]
//! - **Admission control**: [`rate_limit`], [`concurrency`]
//! - **Dialect translation**: [`protocol`]
//! - **Glue**: [`config`], [`upstream`], [`server`]
//!
//! ## Quick start
//!
//! ```no_run
//! use llm_relay::config::Settings;
//! use llm_relay::server::{self, AppState};
//! use std::net::SocketAddr;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Settings::from_yaml(
//!         r#"
//! backends:
//!   - name: openai
//!     url: https://api.openai.com
//! models:
//!   gpt-4:
//!     routes:
//!       - backend: openai
//!         model: gpt-4o
//! "#,
//!     )?
//!     .into_runtime()?;
//!     let listen = config.listen.clone();
//!     let state = AppState::new(config)?;
//!     let app = server::router(state.clone());
//!     let listener = tokio::net::TcpListener::bind(&listen).await?;
//!     axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod balancer;
pub mod breaker;
pub mod chat;
pub mod concurrency;
pub mod config;
pub mod cooldown;
pub mod error;
pub mod fallback;
pub mod protocol;
pub mod rate_limit;
pub mod routes;
pub mod server;
pub mod time;
pub mod upstream;

pub use backoff::{BackoffPolicy, RetryPolicy};
pub use balancer::{LoadBalancer, Strategy};
pub use breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState};
pub use chat::{ChatRequest, ChatResponse, StopReason, StreamChunk};
pub use concurrency::ConcurrencyLimiter;
pub use config::{ConfigStore, RuntimeConfig, Settings};
pub use cooldown::CooldownTracker;
pub use error::{ErrorKind, ProxyError};
pub use fallback::{FallbackEngine, FallbackOutcome};
pub use protocol::{default_registry, Protocol, StrategyRegistry, StrategySet};
pub use rate_limit::RateLimiter;
pub use routes::{Backend, ModelAlias, ModelRoute, Route};
