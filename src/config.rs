//! Configuration: file settings, the normalized runtime snapshot, and the
//! live-reload signal.
//!
//! `Settings` mirrors the YAML file; `RuntimeConfig` is the validated,
//! hydrated snapshot the core consumes. The active snapshot lives in an
//! [`arc_swap::ArcSwap`] so readers never observe a torn write; replacement
//! bumps a `tokio::sync::watch` generation that admission components use as
//! their reconfigure signal.

use crate::backoff::{BackoffPolicy, RetryPolicy};
use crate::balancer::Strategy;
use crate::breaker::BreakerConfig;
use crate::error::ProxyError;
use crate::protocol::Protocol;
use crate::routes::{Backend, ModelAlias, ModelRoute};
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_true() -> bool {
    true
}

fn default_listen() -> String {
    ":8765".to_string()
}

/// `v` when positive, else `fallback`.
fn pos_u64(v: u64, fallback: u64) -> u64 {
    if v == 0 { fallback } else { v }
}

fn pos_u32(v: u32, fallback: u32) -> u32 {
    if v == 0 { fallback } else { v }
}

fn pos_f64(v: f64, fallback: f64) -> f64 {
    if v > 0.0 && v.is_finite() { v } else { fallback }
}

// ---------------------------------------------------------------------------
// Raw file shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub proxy_api_key: Option<String>,
    #[serde(default)]
    pub backends: Vec<BackendSettings>,
    #[serde(default)]
    pub models: HashMap<String, AliasSettings>,
    #[serde(default)]
    pub load_balance: Option<Strategy>,
    #[serde(default)]
    pub fallback: FallbackSettings,
    #[serde(default)]
    pub error_fallback: ErrorFallbackSettings,
    #[serde(default)]
    pub timeout: TimeoutSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub concurrency: ConcurrencySettings,
    #[serde(default)]
    pub proxy: ProxySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendSettings {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub locale: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AliasSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub routes: Vec<RouteSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteSettings {
    pub backend: String,
    pub model: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub reasoning: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FallbackSettings {
    #[serde(default)]
    pub cooldown_seconds: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub alias_fallback: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub enable_backoff: bool,
    #[serde(default)]
    pub backoff_initial_delay_ms: u64,
    #[serde(default)]
    pub backoff_max_delay_ms: u64,
    #[serde(default)]
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub backoff_jitter: Option<f64>,
    #[serde(default)]
    pub enable_circuit_breaker: bool,
    #[serde(default)]
    pub circuit_failure_threshold: u32,
    #[serde(default)]
    pub circuit_success_threshold: u32,
    #[serde(default)]
    pub circuit_open_timeout_s: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorFallbackSettings {
    #[serde(default)]
    pub server_error: ServerErrorSettings,
    #[serde(default)]
    pub client_error: ClientErrorSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerErrorSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ServerErrorSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientErrorSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub codes: Vec<u16>,
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeoutSettings {
    /// All values are seconds; zero means "use the default".
    #[serde(default)]
    pub connect: u64,
    #[serde(default)]
    pub read: u64,
    #[serde(default)]
    pub write: u64,
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub global_rps: f64,
    #[serde(default)]
    pub per_ip_rps: f64,
    #[serde(default)]
    pub per_model_rps: HashMap<String, f64>,
    #[serde(default)]
    pub burst_factor: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConcurrencySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub max_requests: u32,
    #[serde(default)]
    pub max_queue_size: u32,
    #[serde(default)]
    pub queue_timeout_secs: u64,
    #[serde(default)]
    pub per_backend_limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxySettings {
    #[serde(default)]
    pub enable_system_prompt: bool,
    #[serde(default = "default_true")]
    pub forward_client_ip: bool,
    #[serde(default)]
    pub system_prompt: SystemPromptSettings,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enable_system_prompt: false,
            forward_client_ip: true,
            system_prompt: SystemPromptSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemPromptSettings {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub custom_variables: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Normalized runtime shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub cooldown: Duration,
    pub retry: RetryPolicy,
    pub alias_fallback: HashMap<String, Vec<String>>,
    pub enable_circuit_breaker: bool,
    pub breaker: BreakerConfig,
}

#[derive(Debug, Clone)]
pub struct ErrorFallbackConfig {
    pub server_error_enabled: bool,
    pub client_error_enabled: bool,
    pub client_error_codes: Vec<u16>,
    pub client_error_patterns: Vec<String>,
}

impl ErrorFallbackConfig {
    /// Effective retryability of an upstream error under this policy.
    ///
    /// Disabling `server_error` pins 5xx as terminal; enabling `client_error`
    /// promotes 4xx responses matching a configured code or message pattern
    /// to retryable. 429 keeps its classification either way.
    pub fn is_retryable(&self, err: &ProxyError) -> bool {
        if err.status == 429 {
            return err.retryable;
        }
        if err.status >= 500 {
            return self.server_error_enabled && err.retryable;
        }
        if (400..500).contains(&err.status) && self.client_error_enabled {
            if self.client_error_codes.contains(&err.status) {
                return true;
            }
            if self.client_error_patterns.iter().any(|p| err.message.contains(p.as_str())) {
                return true;
            }
        }
        err.retryable
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
    pub total: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub global_rps: f64,
    pub per_ip_rps: f64,
    pub per_model_rps: HashMap<String, f64>,
    pub burst_factor: f64,
}

#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    pub enabled: bool,
    pub max_in_flight: usize,
    pub max_queue: usize,
    pub queue_timeout: Duration,
    pub per_backend_limit: usize,
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub enable_system_prompt: bool,
    pub forward_client_ip: bool,
    pub system_prompt: String,
    pub custom_variables: HashMap<String, String>,
}

impl ProxyOptions {
    /// The rendered system prompt, with `{key}` placeholders substituted.
    pub fn rendered_system_prompt(&self) -> Option<String> {
        if !self.enable_system_prompt || self.system_prompt.is_empty() {
            return None;
        }
        let mut rendered = self.system_prompt.clone();
        for (key, value) in &self.custom_variables {
            rendered = rendered.replace(&format!("{{{key}}}"), value);
        }
        Some(rendered)
    }
}

/// The immutable snapshot visible to in-flight requests.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub proxy_api_key: Option<String>,
    pub backends: HashMap<String, Arc<Backend>>,
    pub aliases: HashMap<String, ModelAlias>,
    pub load_balance: Strategy,
    pub fallback: FallbackConfig,
    pub error_fallback: ErrorFallbackConfig,
    pub timeouts: TimeoutConfig,
    pub rate_limit: RateLimitConfig,
    pub concurrency: ConcurrencyConfig,
    pub proxy: ProxyOptions,
}

impl Settings {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Validate and hydrate into the snapshot the core consumes.
    pub fn into_runtime(self) -> Result<RuntimeConfig, ConfigError> {
        let mut backends = HashMap::new();
        for b in self.backends {
            if b.name.is_empty() {
                return Err(ConfigError::Invalid("backend name must be non-empty".into()));
            }
            if !(b.url.starts_with("http://") || b.url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "backend {}: url must be absolute, got {:?}",
                    b.name, b.url
                )));
            }
            let backend = Backend {
                name: b.name.clone(),
                url: b.url.trim_end_matches('/').to_string(),
                api_key: b.api_key,
                enabled: b.enabled,
                protocol: b.protocol,
                locale: b.locale,
            };
            if backends.insert(b.name.clone(), Arc::new(backend)).is_some() {
                return Err(ConfigError::Invalid(format!("duplicate backend name: {}", b.name)));
            }
        }

        let aliases = self
            .models
            .into_iter()
            .map(|(name, alias)| {
                let routes = alias
                    .routes
                    .into_iter()
                    .map(|r| ModelRoute {
                        backend: r.backend,
                        model: r.model,
                        priority: r.priority,
                        enabled: r.enabled,
                        protocol: r.protocol,
                        reasoning: r.reasoning,
                    })
                    .collect();
                (name, ModelAlias { enabled: alias.enabled, routes })
            })
            .collect();

        let f = self.fallback;
        let backoff = BackoffPolicy::new(
            f.enable_backoff,
            Duration::from_millis(pos_u64(f.backoff_initial_delay_ms, 100)),
            Duration::from_millis(pos_u64(f.backoff_max_delay_ms, 5000)),
            pos_f64(f.backoff_multiplier, 2.0),
            f.backoff_jitter.unwrap_or(0.1),
        );
        let fallback = FallbackConfig {
            cooldown: Duration::from_secs(pos_u64(f.cooldown_seconds, 60)),
            retry: RetryPolicy::new(pos_u32(f.max_retries, 3), backoff),
            alias_fallback: f.alias_fallback,
            enable_circuit_breaker: f.enable_circuit_breaker,
            breaker: BreakerConfig {
                failure_threshold: f.circuit_failure_threshold,
                success_threshold: f.circuit_success_threshold,
                open_timeout: Duration::from_secs(f.circuit_open_timeout_s),
                half_open_max: 0,
            }
            .sanitized(),
        };

        let error_fallback = ErrorFallbackConfig {
            server_error_enabled: self.error_fallback.server_error.enabled,
            client_error_enabled: self.error_fallback.client_error.enabled,
            client_error_codes: self.error_fallback.client_error.codes,
            client_error_patterns: self.error_fallback.client_error.patterns,
        };

        let timeouts = TimeoutConfig {
            connect: Duration::from_secs(pos_u64(self.timeout.connect, 10)),
            read: Duration::from_secs(pos_u64(self.timeout.read, 60)),
            write: Duration::from_secs(pos_u64(self.timeout.write, 60)),
            total: Duration::from_secs(pos_u64(self.timeout.total, 120)),
        };

        let rate_limit = RateLimitConfig {
            enabled: self.rate_limit.enabled,
            global_rps: pos_f64(self.rate_limit.global_rps, 1000.0),
            per_ip_rps: pos_f64(self.rate_limit.per_ip_rps, 100.0),
            per_model_rps: self
                .rate_limit
                .per_model_rps
                .into_iter()
                .filter(|(_, rps)| *rps > 0.0)
                .collect(),
            burst_factor: pos_f64(self.rate_limit.burst_factor, 1.5).max(1.0),
        };

        let concurrency = ConcurrencyConfig {
            enabled: self.concurrency.enabled,
            max_in_flight: pos_u32(self.concurrency.max_requests, 500) as usize,
            max_queue: pos_u32(self.concurrency.max_queue_size, 1000) as usize,
            queue_timeout: Duration::from_secs(pos_u64(self.concurrency.queue_timeout_secs, 30)),
            per_backend_limit: pos_u32(self.concurrency.per_backend_limit, 100) as usize,
        };

        let proxy = ProxyOptions {
            enable_system_prompt: self.proxy.enable_system_prompt,
            forward_client_ip: self.proxy.forward_client_ip,
            system_prompt: self.proxy.system_prompt.content,
            custom_variables: self.proxy.system_prompt.custom_variables,
        };

        // A bare ":port" listen address binds every interface.
        let listen = if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen
        };

        Ok(RuntimeConfig {
            listen,
            proxy_api_key: self.proxy_api_key,
            backends,
            aliases,
            load_balance: self.load_balance.unwrap_or(Strategy::RoundRobin),
            fallback,
            error_fallback,
            timeouts,
            rate_limit,
            concurrency,
            proxy,
        })
    }
}

/// Read and hydrate a configuration file.
pub fn load_file(path: &std::path::Path) -> Result<RuntimeConfig, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    Settings::from_yaml(&text)?.into_runtime()
}

// ---------------------------------------------------------------------------
// Store and reload
// ---------------------------------------------------------------------------

/// Holder of the active snapshot plus the change-notification signal.
#[derive(Debug)]
pub struct ConfigStore {
    current: ArcSwap<RuntimeConfig>,
    generation: AtomicU64,
    changed: watch::Sender<u64>,
}

impl ConfigStore {
    pub fn new(config: RuntimeConfig) -> Self {
        let (changed, _) = watch::channel(0);
        Self { current: ArcSwap::from_pointee(config), generation: AtomicU64::new(0), changed }
    }

    /// The active snapshot. Cheap; safe to hold across awaits.
    pub fn current(&self) -> Arc<RuntimeConfig> {
        self.current.load_full()
    }

    /// Atomically install a new snapshot and fire the change signal.
    pub fn replace(&self, config: RuntimeConfig) {
        self.current.store(Arc::new(config));
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.changed.send(generation);
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }
}

/// Poll the config file's mtime and swap in a fresh snapshot when it changes.
/// Parse failures keep the previous snapshot.
pub fn spawn_reload_task(
    store: Arc<ConfigStore>,
    path: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_modified: Option<SystemTime> = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => return,
            }
            let modified = match std::fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "config file unreadable");
                    continue;
                }
            };
            if last_modified == Some(modified) {
                continue;
            }
            last_modified = Some(modified);
            match load_file(&path) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "configuration reloaded");
                    store.replace(config);
                }
                Err(err) => {
                    tracing::error!(path = %path.display(), %err, "config reload failed; keeping previous snapshot");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
listen: ":9000"
proxy_api_key: secret
backends:
  - name: openai-main
    url: https://api.openai.com
    api_key: sk-test
    protocol: openai
  - name: claude
    url: https://api.anthropic.com/
    api_key: ak-test
    protocol: anthropic
    locale: en-US
models:
  gpt-4:
    routes:
      - backend: openai-main
        model: gpt-4o
        priority: 1
      - backend: claude
        model: claude-sonnet-4
        priority: 2
        reasoning: true
fallback:
  cooldown_seconds: 30
  max_retries: 2
  alias_fallback:
    gpt-4: [gpt-4-mini]
  enable_backoff: true
  backoff_initial_delay_ms: 50
  backoff_jitter: 0.2
  enable_circuit_breaker: true
rate_limit:
  enabled: true
  global_rps: 200
  per_model_rps:
    gpt-4: 1.0
concurrency:
  enabled: true
  max_requests: 1
  queue_timeout_secs: 1
proxy:
  enable_system_prompt: true
  system_prompt:
    content: "You are {name}."
    custom_variables:
      name: Relay
"#;

    #[test]
    fn full_document_parses_and_normalizes() {
        let cfg = Settings::from_yaml(FULL).unwrap().into_runtime().unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:9000");
        assert_eq!(cfg.proxy_api_key.as_deref(), Some("secret"));
        assert_eq!(cfg.backends.len(), 2);
        assert_eq!(cfg.backends["claude"].protocol, Protocol::Anthropic);
        // Trailing slash stripped during hydration.
        assert_eq!(cfg.backends["claude"].url, "https://api.anthropic.com");
        assert_eq!(cfg.aliases["gpt-4"].routes.len(), 2);
        assert!(cfg.aliases["gpt-4"].routes[1].reasoning);
        assert_eq!(cfg.fallback.cooldown, Duration::from_secs(30));
        assert_eq!(cfg.fallback.retry.max_retries, 2);
        assert_eq!(cfg.fallback.alias_fallback["gpt-4"], vec!["gpt-4-mini"]);
        assert!(cfg.fallback.enable_circuit_breaker);
        assert_eq!(cfg.rate_limit.global_rps, 200.0);
        assert_eq!(cfg.rate_limit.per_model_rps["gpt-4"], 1.0);
        assert_eq!(cfg.concurrency.max_in_flight, 1);
        assert_eq!(cfg.proxy.rendered_system_prompt().unwrap(), "You are Relay.");
    }

    #[test]
    fn defaults_fill_unset_sections() {
        let cfg = Settings::from_yaml("{}").unwrap().into_runtime().unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:8765");
        assert_eq!(cfg.fallback.cooldown, Duration::from_secs(60));
        assert_eq!(cfg.fallback.retry.max_retries, 3);
        assert_eq!(cfg.fallback.breaker.failure_threshold, 5);
        assert_eq!(cfg.fallback.breaker.open_timeout, Duration::from_secs(60));
        assert!(!cfg.rate_limit.enabled);
        assert_eq!(cfg.rate_limit.global_rps, 1000.0);
        assert_eq!(cfg.rate_limit.per_ip_rps, 100.0);
        assert_eq!(cfg.rate_limit.burst_factor, 1.5);
        assert_eq!(cfg.concurrency.max_in_flight, 500);
        assert_eq!(cfg.concurrency.max_queue, 1000);
        assert_eq!(cfg.concurrency.queue_timeout, Duration::from_secs(30));
        assert!(cfg.proxy.forward_client_ip);
        assert!(cfg.proxy.rendered_system_prompt().is_none());
        assert_eq!(cfg.load_balance, Strategy::RoundRobin);
    }

    #[test]
    fn relative_url_is_rejected() {
        let yaml = "backends:\n  - name: a\n    url: api.openai.com\n";
        let err = Settings::from_yaml(yaml).unwrap().into_runtime().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn duplicate_backend_name_is_rejected() {
        let yaml = "backends:\n  - name: a\n    url: http://x\n  - name: a\n    url: http://y\n";
        let err = Settings::from_yaml(yaml).unwrap().into_runtime().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn protocol_tag_aliases_collapse_to_openai() {
        for tag in ["deepseek", "groq", "mistral", "cohere"] {
            let yaml = format!("backends:\n  - name: b\n    url: http://x\n    protocol: {tag}\n");
            let cfg = Settings::from_yaml(&yaml).unwrap().into_runtime().unwrap();
            assert_eq!(cfg.backends["b"].protocol, Protocol::OpenAi, "tag {tag}");
        }
    }

    #[test]
    fn error_fallback_defaults_retry_server_errors() {
        let cfg = Settings::from_yaml("{}").unwrap().into_runtime().unwrap();
        let upstream_500 = ProxyError::from_status(500, "boom");
        assert!(cfg.error_fallback.is_retryable(&upstream_500));
    }

    #[test]
    fn error_fallback_can_pin_server_errors_terminal() {
        let yaml = "error_fallback:\n  server_error:\n    enabled: false\n";
        let cfg = Settings::from_yaml(yaml).unwrap().into_runtime().unwrap();
        let upstream_500 = ProxyError::from_status(500, "boom");
        assert!(!cfg.error_fallback.is_retryable(&upstream_500));
        // 429 keeps its classification regardless.
        let upstream_429 = ProxyError::from_status(429, "slow down");
        assert!(cfg.error_fallback.is_retryable(&upstream_429));
    }

    #[test]
    fn error_fallback_promotes_configured_client_errors() {
        let yaml = r#"
error_fallback:
  client_error:
    enabled: true
    codes: [422]
    patterns: ["model is overloaded"]
"#;
        let cfg = Settings::from_yaml(yaml).unwrap().into_runtime().unwrap();
        assert!(cfg.error_fallback.is_retryable(&ProxyError::from_status(422, "unprocessable")));
        assert!(cfg
            .error_fallback
            .is_retryable(&ProxyError::from_status(400, "the model is overloaded, try later")));
        assert!(!cfg.error_fallback.is_retryable(&ProxyError::from_status(400, "bad json")));
    }

    #[test]
    fn store_replace_fires_change_signal() {
        let cfg = Settings::from_yaml("{}").unwrap().into_runtime().unwrap();
        let store = ConfigStore::new(cfg.clone());
        let rx = store.subscribe();
        assert_eq!(*rx.borrow(), 0);
        store.replace(cfg);
        assert_eq!(*rx.borrow(), 1);
    }
}
