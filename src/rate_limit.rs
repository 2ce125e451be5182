//! Multi-dimensional token-bucket rate limiting.
//!
//! Three layers gate every request: a global bucket, one bucket per client
//! IP, and one per model name. A request is admitted only when every
//! applicable bucket yields a token; consumption is best-effort (an earlier
//! bucket may spend its token even when a later one denies).

use crate::config::RateLimitConfig;
use crate::time::{Clock, MonotonicClock};
use arc_swap::ArcSwap;
use axum::http::HeaderMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_millis: u64,
}

/// A token bucket refilled on access: `rate` tokens per second up to `burst`.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    pub fn new(rate: f64, burst_factor: f64, clock: Arc<dyn Clock>) -> Self {
        let burst = (rate * burst_factor).floor().max(1.0);
        let now = clock.now_millis();
        Self {
            rate: rate.max(0.0),
            burst,
            state: Mutex::new(BucketState { tokens: burst, last_millis: now }),
            clock,
        }
    }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().expect("TokenBucket.allow: lock poisoned");
        let elapsed_secs = now.saturating_sub(state.last_millis) as f64 / 1000.0;
        state.tokens = (state.tokens + elapsed_secs * self.rate).min(self.burst);
        state.last_millis = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// The admission-layer limiter: global + per-IP + per-model buckets,
/// live-reconfigurable.
#[derive(Debug)]
pub struct RateLimiter {
    config: RwLock<RateLimitConfig>,
    global: ArcSwap<TokenBucket>,
    per_ip: RwLock<HashMap<String, Arc<TokenBucket>>>,
    per_model: RwLock<HashMap<String, Arc<TokenBucket>>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let global = TokenBucket::new(config.global_rps, config.burst_factor, Arc::clone(&clock));
        Self {
            config: RwLock::new(config.clone()),
            global: ArcSwap::from_pointee(global),
            per_ip: RwLock::new(HashMap::new()),
            per_model: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Admit or reject one request. Always admits when disabled.
    pub fn allow(&self, ip: &str, model: Option<&str>) -> bool {
        let config = self.config.read().expect("RateLimiter.allow: config lock poisoned").clone();
        if !config.enabled {
            return true;
        }
        if !self.global.load().allow() {
            tracing::debug!(ip, "global rate limit exceeded");
            return false;
        }
        if !self.ip_bucket(ip, &config).allow() {
            tracing::debug!(ip, "per-ip rate limit exceeded");
            return false;
        }
        if let Some(model) = model {
            if !self.model_bucket(model, &config).allow() {
                tracing::debug!(model, "per-model rate limit exceeded");
                return false;
            }
        }
        true
    }

    fn ip_bucket(&self, ip: &str, config: &RateLimitConfig) -> Arc<TokenBucket> {
        {
            let buckets = self.per_ip.read().expect("RateLimiter.ip_bucket: lock poisoned");
            if let Some(bucket) = buckets.get(ip) {
                return Arc::clone(bucket);
            }
        }
        let mut buckets = self.per_ip.write().expect("RateLimiter.ip_bucket: lock poisoned");
        Arc::clone(buckets.entry(ip.to_string()).or_insert_with(|| {
            Arc::new(TokenBucket::new(
                config.per_ip_rps,
                config.burst_factor,
                Arc::clone(&self.clock),
            ))
        }))
    }

    fn model_bucket(&self, model: &str, config: &RateLimitConfig) -> Arc<TokenBucket> {
        {
            let buckets = self.per_model.read().expect("RateLimiter.model_bucket: lock poisoned");
            if let Some(bucket) = buckets.get(model) {
                return Arc::clone(bucket);
            }
        }
        let rate = config.per_model_rps.get(model).copied().unwrap_or(config.global_rps);
        let mut buckets = self.per_model.write().expect("RateLimiter.model_bucket: lock poisoned");
        Arc::clone(buckets.entry(model.to_string()).or_insert_with(|| {
            Arc::new(TokenBucket::new(rate, config.burst_factor, Arc::clone(&self.clock)))
        }))
    }

    /// Install new parameters: the global bucket is rebuilt and the lazy
    /// per-IP / per-model buckets are discarded so they are recreated on
    /// next sight.
    pub fn reconfigure(&self, config: &RateLimitConfig) {
        *self.config.write().expect("RateLimiter.reconfigure: config lock poisoned") =
            config.clone();
        self.global.store(Arc::new(TokenBucket::new(
            config.global_rps,
            config.burst_factor,
            Arc::clone(&self.clock),
        )));
        self.per_ip.write().expect("RateLimiter.reconfigure: ip lock poisoned").clear();
        self.per_model.write().expect("RateLimiter.reconfigure: model lock poisoned").clear();
        tracing::info!(
            enabled = config.enabled,
            global_rps = config.global_rps,
            per_ip_rps = config.per_ip_rps,
            "rate limiter reconfigured"
        );
    }
}

/// Client IP in preference order: `X-Forwarded-For` (first hop) →
/// `X-Real-IP` → transport peer address host part.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string()).unwrap_or_else(|| "unknown".to_string())
}

/// Pull the `model` field out of a JSON request body, if present.
pub fn extract_model(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("model").and_then(|m| m.as_str()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn config(enabled: bool) -> RateLimitConfig {
        RateLimitConfig {
            enabled,
            global_rps: 10.0,
            per_ip_rps: 2.0,
            per_model_rps: HashMap::from([("gpt-4".to_string(), 1.0)]),
            burst_factor: 1.0,
        }
    }

    fn limiter(enabled: bool) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new();
        (RateLimiter::with_clock(&config(enabled), Arc::new(clock.clone())), clock)
    }

    #[test]
    fn bucket_starts_full_and_refills() {
        let clock = ManualClock::new();
        let bucket = TokenBucket::new(2.0, 1.0, Arc::new(clock.clone()));
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());

        // 2 rps: one token back after 500ms.
        clock.advance(500);
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[test]
    fn bucket_caps_at_burst() {
        let clock = ManualClock::new();
        let bucket = TokenBucket::new(10.0, 1.5, Arc::new(clock.clone()));
        clock.advance(60_000);
        let mut admitted = 0;
        while bucket.allow() {
            admitted += 1;
        }
        assert_eq!(admitted, 15);
    }

    #[test]
    fn admitted_count_bounded_over_window() {
        let clock = ManualClock::new();
        let bucket = TokenBucket::new(10.0, 1.5, Arc::new(clock.clone()));
        let mut admitted = 0;
        // One second simulated in 10ms steps, hammering each step.
        for _ in 0..100 {
            clock.advance(10);
            for _ in 0..10 {
                if bucket.allow() {
                    admitted += 1;
                }
            }
        }
        assert!(admitted <= 10 + 15, "admitted {admitted} exceeds rate*window + burst");
    }

    #[test]
    fn disabled_limiter_always_admits() {
        let (limiter, _clock) = limiter(false);
        for _ in 0..1000 {
            assert!(limiter.allow("1.2.3.4", Some("gpt-4")));
        }
    }

    #[test]
    fn per_model_limit_spans_distinct_ips() {
        let (limiter, _clock) = limiter(true);
        assert!(limiter.allow("1.1.1.1", Some("gpt-4")));
        assert!(!limiter.allow("2.2.2.2", Some("gpt-4")), "model bucket must be shared across IPs");
    }

    #[test]
    fn unlisted_model_uses_global_rate() {
        let (limiter, _clock) = limiter(true);
        // per_ip_rps=2 is the binding constraint for a single IP here.
        assert!(limiter.allow("1.1.1.1", Some("other-model")));
        assert!(limiter.allow("1.1.1.1", Some("other-model")));
        assert!(!limiter.allow("1.1.1.1", Some("other-model")));
    }

    #[test]
    fn per_ip_buckets_are_independent() {
        let (limiter, _clock) = limiter(true);
        for _ in 0..2 {
            assert!(limiter.allow("1.1.1.1", None));
        }
        assert!(!limiter.allow("1.1.1.1", None));
        assert!(limiter.allow("2.2.2.2", None));
    }

    #[test]
    fn reconfigure_discards_lazy_buckets() {
        let (limiter, _clock) = limiter(true);
        for _ in 0..2 {
            limiter.allow("1.1.1.1", None);
        }
        assert!(!limiter.allow("1.1.1.1", None));

        let mut new_config = config(true);
        new_config.per_ip_rps = 100.0;
        limiter.reconfigure(&new_config);
        assert!(limiter.allow("1.1.1.1", None), "fresh bucket must apply the new rate");
    }

    #[test]
    fn client_ip_preference_order() {
        let peer: SocketAddr = "10.0.0.9:1234".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        assert_eq!(client_ip(&headers, Some(peer)), "203.0.113.7");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        assert_eq!(client_ip(&headers, Some(peer)), "198.51.100.2");

        assert_eq!(client_ip(&HeaderMap::new(), Some(peer)), "10.0.0.9");
        assert_eq!(client_ip(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn model_extraction_from_body() {
        assert_eq!(extract_model(br#"{"model":"gpt-4","messages":[]}"#), Some("gpt-4".into()));
        assert_eq!(extract_model(br#"{"messages":[]}"#), None);
        assert_eq!(extract_model(b"not json"), None);
    }
}
