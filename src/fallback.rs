//! Fallback orchestration: filter-available → select → attempt → advance.
//!
//! One engine call runs the full candidate walk for a request: resolve the
//! alias, drop cooling-down candidates, order by priority with the load
//! balancer choosing within each band, then attempt candidates in turn.
//! Circuit-denied and capacity-busy candidates are skipped without spending
//! the retry budget; retryable failures cool the candidate down, sleep the
//! backoff delay, and advance. Terminal failures surface immediately.

use crate::balancer::{LoadBalancer, Strategy};
use crate::breaker::{BreakerRegistry, CircuitBreaker};
use crate::concurrency::{BackendAdmission, ConcurrencyLimiter};
use crate::config::RuntimeConfig;
use crate::cooldown::CooldownTracker;
use crate::error::{ErrorKind, ProxyError};
use crate::routes::{resolve_alias, Route};
use crate::time::{Sleeper, TokioSleeper};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Successful walk result: the value plus which candidate produced it.
#[derive(Debug)]
pub struct FallbackOutcome<T> {
    pub value: T,
    pub route: Route,
    pub attempts: u32,
}

pub struct FallbackEngine {
    cooldowns: Arc<CooldownTracker>,
    breakers: Arc<BreakerRegistry>,
    concurrency: Arc<ConcurrencyLimiter>,
    balancer: LoadBalancer,
    sleeper: Arc<dyn Sleeper>,
}

impl FallbackEngine {
    pub fn new(
        cooldowns: Arc<CooldownTracker>,
        breakers: Arc<BreakerRegistry>,
        concurrency: Arc<ConcurrencyLimiter>,
    ) -> Self {
        Self {
            cooldowns,
            breakers,
            concurrency,
            balancer: LoadBalancer::new(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Walk the candidates for `alias`, invoking `attempt` per candidate
    /// until one succeeds, the retry budget is spent, or a terminal error
    /// surfaces.
    pub async fn execute<T, F, Fut>(
        &self,
        config: &RuntimeConfig,
        alias: &str,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<FallbackOutcome<T>, ProxyError>
    where
        F: FnMut(Route) -> Fut,
        Fut: Future<Output = Result<T, ProxyError>>,
    {
        let primary = resolve_alias(config, alias)?;
        let mut candidates = self.filter_available(&primary);
        let mut used_alias_fallback = false;
        if candidates.is_empty() {
            candidates = self.alias_fallback_candidates(config, alias);
            used_alias_fallback = true;
        }
        if candidates.is_empty() {
            return Err(no_available(alias));
        }

        let mut queue: VecDeque<Route> = self.order(config.load_balance, candidates).into();
        let retry = &config.fallback.retry;
        let mut attempts: u32 = 0;
        let mut last_err: Option<ProxyError> = None;

        while let Some(route) = queue.pop_front() {
            let _backend_slot = match self.concurrency.try_acquire_backend(&route.backend.name) {
                BackendAdmission::Busy => {
                    tracing::debug!(backend = %route.backend.name, "backend at capacity, advancing");
                    last_err.get_or_insert_with(|| backend_busy(&route));
                    continue;
                }
                BackendAdmission::Admitted(guard) => Some(guard),
                BackendAdmission::Disabled => None,
            };

            let breaker = self.gate(config, &route);
            if let Some(breaker) = &breaker {
                // A denied candidate is skipped without consuming a retry.
                if !breaker.allow_request() {
                    tracing::debug!(
                        backend = %route.backend.name,
                        model = %route.model,
                        "circuit open, advancing"
                    );
                    last_err.get_or_insert_with(|| circuit_open(&route));
                    continue;
                }
            }

            attempts += 1;
            match attempt(route.clone()).await {
                Ok(value) => {
                    if let Some(breaker) = &breaker {
                        breaker.record_success();
                    }
                    return Ok(FallbackOutcome { value, route, attempts });
                }
                Err(mut err) => {
                    if let Some(breaker) = &breaker {
                        breaker.record_failure();
                    }
                    err.retryable = config.error_fallback.is_retryable(&err);
                    tracing::warn!(
                        backend = %route.backend.name,
                        model = %route.model,
                        status = err.status,
                        retryable = err.retryable,
                        attempt = attempts,
                        "backend attempt failed: {err}"
                    );
                    if !err.retryable {
                        return Err(err);
                    }
                    self.cooldowns.set_cooldown(
                        &route.backend.name,
                        &route.model,
                        config.fallback.cooldown,
                    );
                    if !retry.should_retry(attempts, &err) {
                        return Err(err);
                    }
                    let mut delay = retry.delay(attempts);
                    if let Some(retry_after) = err.retry_after {
                        delay = delay.max(retry_after);
                    }
                    if !self.sleeper.sleep(delay, cancel).await {
                        return Err(ProxyError::cancelled());
                    }
                    last_err = Some(err);
                    if queue.is_empty() && !used_alias_fallback {
                        used_alias_fallback = true;
                        let extra = self.alias_fallback_candidates(config, alias);
                        queue.extend(self.order(config.load_balance, extra));
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| no_available(alias)))
    }

    fn gate(&self, config: &RuntimeConfig, route: &Route) -> Option<Arc<CircuitBreaker>> {
        config
            .fallback
            .enable_circuit_breaker
            .then(|| self.breakers.get(&route.backend.name, &route.model))
    }

    /// Drop candidates that are cooling down or whose backend is disabled.
    fn filter_available(&self, routes: &[Route]) -> Vec<Route> {
        routes
            .iter()
            .filter(|route| {
                route.backend.enabled
                    && !self.cooldowns.is_cooling_down(&route.backend.name, &route.model)
            })
            .cloned()
            .collect()
    }

    /// Union of the alias-level fallback aliases' routes, in declared order,
    /// deduplicated and filtered. Aliases that fail to resolve are skipped.
    fn alias_fallback_candidates(&self, config: &RuntimeConfig, alias: &str) -> Vec<Route> {
        let Some(fallbacks) = config.fallback.alias_fallback.get(alias) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for fallback_alias in fallbacks {
            match resolve_alias(config, fallback_alias) {
                Ok(routes) => {
                    for route in self.filter_available(&routes) {
                        if seen.insert(route.cooldown_key()) {
                            candidates.push(route);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(alias = %fallback_alias, "skipping fallback alias: {err}");
                }
            }
        }
        candidates
    }

    /// Deterministic walk order: priority bands ascending; within a band the
    /// balancer's pick goes first and the rest follow in declared order.
    fn order(&self, strategy: Strategy, mut routes: Vec<Route>) -> Vec<Route> {
        routes.sort_by_key(|route| route.priority);
        let mut ordered = Vec::with_capacity(routes.len());
        let mut start = 0;
        while start < routes.len() {
            let len = routes[start..]
                .iter()
                .take_while(|route| route.priority == routes[start].priority)
                .count();
            let band = &routes[start..start + len];
            let pick = self.balancer.select(strategy, band).unwrap_or(0);
            ordered.extend(band[pick..].iter().cloned());
            ordered.extend(band[..pick].iter().cloned());
            start += len;
        }
        ordered
    }
}

fn no_available(alias: &str) -> ProxyError {
    ProxyError::new(
        ErrorKind::BackendError,
        503,
        format!("no available backend for alias {alias}"),
    )
    .with_retryable(false)
}

fn circuit_open(route: &Route) -> ProxyError {
    ProxyError::new(
        ErrorKind::BackendError,
        503,
        format!("circuit open for {}", route.cooldown_key()),
    )
    .with_retryable(false)
}

fn backend_busy(route: &Route) -> ProxyError {
    ProxyError::new(
        ErrorKind::BackendError,
        503,
        format!("backend {} at capacity", route.backend.name),
    )
    .with_retryable(false)
}
