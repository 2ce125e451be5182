//! Bounded in-flight concurrency with a bounded wait queue.
//!
//! Admission takes one slot from a semaphore sized `max_in_flight`; callers
//! over that cap wait in a queue bounded by `max_queue` for at most
//! `queue_timeout`. Slots are released by dropping the returned guard, so
//! every exit path releases exactly once. Per-backend slots use the same
//! guard discipline but never wait: a busy backend is skipped, not queued.

use crate::config::ConcurrencyConfig;
use crate::error::ProxyError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
struct LimiterState {
    enabled: bool,
    semaphore: Arc<Semaphore>,
    max_queue: usize,
    queue_timeout: Duration,
    per_backend_limit: usize,
}

/// Holder of one global in-flight slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct SlotGuard {
    _permit: OwnedSemaphorePermit,
}

/// Holder of one per-backend slot.
#[derive(Debug)]
pub struct BackendGuard {
    _permit: OwnedSemaphorePermit,
}

/// Outcome of a non-blocking per-backend admission check.
#[derive(Debug)]
pub enum BackendAdmission {
    Disabled,
    Admitted(BackendGuard),
    Busy,
}

#[derive(Debug)]
pub struct ConcurrencyLimiter {
    state: RwLock<LimiterState>,
    queued: Arc<AtomicUsize>,
    per_backend: RwLock<HashMap<String, Arc<Semaphore>>>,
}

/// Scoped queue-depth increment; decrements on drop no matter how the
/// acquisition attempt ends.
struct QueueToken {
    counter: Arc<AtomicUsize>,
}

impl QueueToken {
    /// Bounded check-and-increment as one atomic step, so concurrent callers
    /// can never push queue depth past `max_queue`. `None` means the queue
    /// is full.
    fn try_new(counter: &Arc<AtomicUsize>, max_queue: usize) -> Option<Self> {
        let previous = counter.fetch_add(1, Ordering::SeqCst);
        if previous >= max_queue {
            counter.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(Self { counter: Arc::clone(counter) })
    }
}

impl Drop for QueueToken {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    pub fn new(config: &ConcurrencyConfig) -> Self {
        Self {
            state: RwLock::new(Self::state_from(config)),
            queued: Arc::new(AtomicUsize::new(0)),
            per_backend: RwLock::new(HashMap::new()),
        }
    }

    fn state_from(config: &ConcurrencyConfig) -> LimiterState {
        LimiterState {
            enabled: config.enabled,
            semaphore: Arc::new(Semaphore::new(config.max_in_flight)),
            max_queue: config.max_queue,
            queue_timeout: config.queue_timeout,
            per_backend_limit: config.per_backend_limit,
        }
    }

    /// Take one in-flight slot, waiting in the bounded queue if necessary.
    ///
    /// Returns `Ok(None)` when the limiter is disabled, `Ok(Some(guard))` on
    /// admission, and a 503-shaped error on queue overflow or queue timeout.
    pub async fn acquire(&self) -> Result<Option<SlotGuard>, ProxyError> {
        let state =
            self.state.read().expect("ConcurrencyLimiter.acquire: lock poisoned").clone();
        if !state.enabled {
            return Ok(None);
        }
        let Some(_queue_token) = QueueToken::try_new(&self.queued, state.max_queue) else {
            return Err(ProxyError::queue_overflow());
        };
        match tokio::time::timeout(
            state.queue_timeout,
            Arc::clone(&state.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(Some(SlotGuard { _permit: permit })),
            // Semaphore replaced mid-wait by a reconfigure; admit rather than
            // fail a request that was already queued.
            Ok(Err(_)) => Ok(None),
            Err(_) => Err(ProxyError::queue_timeout(state.queue_timeout)),
        }
    }

    /// Non-blocking per-backend slot check.
    pub fn try_acquire_backend(&self, backend: &str) -> BackendAdmission {
        let state = self
            .state
            .read()
            .expect("ConcurrencyLimiter.try_acquire_backend: lock poisoned")
            .clone();
        if !state.enabled {
            return BackendAdmission::Disabled;
        }
        let semaphore = self.backend_semaphore(backend, state.per_backend_limit);
        match semaphore.try_acquire_owned() {
            Ok(permit) => BackendAdmission::Admitted(BackendGuard { _permit: permit }),
            Err(_) => BackendAdmission::Busy,
        }
    }

    fn backend_semaphore(&self, backend: &str, limit: usize) -> Arc<Semaphore> {
        {
            let map = self
                .per_backend
                .read()
                .expect("ConcurrencyLimiter.backend_semaphore: lock poisoned");
            if let Some(semaphore) = map.get(backend) {
                return Arc::clone(semaphore);
            }
        }
        let mut map = self
            .per_backend
            .write()
            .expect("ConcurrencyLimiter.backend_semaphore: lock poisoned");
        Arc::clone(
            map.entry(backend.to_string()).or_insert_with(|| Arc::new(Semaphore::new(limit))),
        )
    }

    /// Install new capacity. Holders of old slots finish normally; new
    /// acquisitions see the fresh semaphore. Waiters on the old semaphore are
    /// admitted (brief over-admission during the swap is acceptable).
    pub fn reconfigure(&self, config: &ConcurrencyConfig) {
        let old = {
            let mut state =
                self.state.write().expect("ConcurrencyLimiter.reconfigure: lock poisoned");
            std::mem::replace(&mut *state, Self::state_from(config))
        };
        old.semaphore.close();
        self.per_backend
            .write()
            .expect("ConcurrencyLimiter.reconfigure: backend lock poisoned")
            .clear();
        tracing::info!(
            enabled = config.enabled,
            max_in_flight = config.max_in_flight,
            max_queue = config.max_queue,
            "concurrency limiter reconfigured"
        );
    }

    /// Current queue depth, for observability.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enabled: bool, max_in_flight: usize, max_queue: usize, timeout_ms: u64) -> ConcurrencyConfig {
        ConcurrencyConfig {
            enabled,
            max_in_flight,
            max_queue,
            queue_timeout: Duration::from_millis(timeout_ms),
            per_backend_limit: 2,
        }
    }

    #[tokio::test]
    async fn disabled_limiter_admits_without_guard() {
        let limiter = ConcurrencyLimiter::new(&config(false, 1, 1, 10));
        assert!(limiter.acquire().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn slots_are_released_on_guard_drop() {
        let limiter = ConcurrencyLimiter::new(&config(true, 1, 5, 50));
        let guard = limiter.acquire().await.unwrap();
        assert!(guard.is_some());
        drop(guard);
        assert!(limiter.acquire().await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out_with_queue_timeout_error() {
        let limiter = Arc::new(ConcurrencyLimiter::new(&config(true, 1, 5, 50)));
        let _held = limiter.acquire().await.unwrap();

        let err = limiter.acquire().await.unwrap_err();
        assert_eq!(err.status, 503);
        assert!(err.message.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_rejected_immediately() {
        let limiter = Arc::new(ConcurrencyLimiter::new(&config(true, 1, 1, 5000)));
        let _held = limiter.acquire().await.unwrap();

        // Fill the single queue slot with a waiter.
        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(limiter.queued(), 1);

        let err = limiter.acquire().await.unwrap_err();
        assert_eq!(err.status, 503);
        assert!(err.message.contains("queue is full"));

        waiter.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admission_never_exceeds_queue_bound() {
        let limiter = Arc::new(ConcurrencyLimiter::new(&config(true, 1, 2, 1000)));
        let _held = limiter.acquire().await.unwrap();

        // 10 callers race for 2 queue slots on real executor threads. The
        // bounded increment must admit exactly 2 waiters (which then time
        // out) and reject the rest immediately as overflow.
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.acquire().await }));
        }

        let mut timeouts = 0;
        let mut overflows = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => panic!("no slot should free up while the holder is alive"),
                Err(err) if err.message.contains("timed out") => timeouts += 1,
                Err(err) => {
                    assert!(err.message.contains("queue is full"), "unexpected: {err}");
                    overflows += 1;
                }
            }
        }
        assert_eq!(timeouts, 2, "exactly the queue bound may wait");
        assert_eq!(overflows, 8);
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test]
    async fn queue_depth_is_restored_after_admission() {
        let limiter = ConcurrencyLimiter::new(&config(true, 2, 2, 50));
        let a = limiter.acquire().await.unwrap();
        let b = limiter.acquire().await.unwrap();
        assert!(a.is_some() && b.is_some());
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_waiter_leaves_no_queue_residue() {
        let limiter = Arc::new(ConcurrencyLimiter::new(&config(true, 1, 3, 5000)));
        let _held = limiter.acquire().await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(limiter.queued(), 1);

        waiter.abort();
        tokio::task::yield_now().await;
        assert_eq!(limiter.queued(), 0, "cancelled waiter must decrement the queue");
    }

    #[tokio::test]
    async fn reconfigure_applies_new_capacity() {
        let limiter = ConcurrencyLimiter::new(&config(true, 1, 1, 20));
        let held = limiter.acquire().await.unwrap();
        assert!(held.is_some());

        limiter.reconfigure(&config(true, 2, 5, 20));
        // Fresh semaphore: two new slots regardless of the old holder.
        let a = limiter.acquire().await.unwrap();
        let b = limiter.acquire().await.unwrap();
        assert!(a.is_some() && b.is_some());
        drop(held);
    }

    #[tokio::test]
    async fn backend_slots_skip_when_busy() {
        let limiter = ConcurrencyLimiter::new(&config(true, 10, 10, 20));
        let a = limiter.try_acquire_backend("b1");
        let b = limiter.try_acquire_backend("b1");
        assert!(matches!(a, BackendAdmission::Admitted(_)));
        assert!(matches!(b, BackendAdmission::Admitted(_)));
        assert!(matches!(limiter.try_acquire_backend("b1"), BackendAdmission::Busy));
        // Other backends are unaffected.
        assert!(matches!(limiter.try_acquire_backend("b2"), BackendAdmission::Admitted(_)));

        drop(a);
        assert!(matches!(limiter.try_acquire_backend("b1"), BackendAdmission::Admitted(_)));
    }

    #[tokio::test]
    async fn backend_slots_disabled_with_limiter() {
        let limiter = ConcurrencyLimiter::new(&config(false, 1, 1, 20));
        assert!(matches!(limiter.try_acquire_backend("b1"), BackendAdmission::Disabled));
    }
}
