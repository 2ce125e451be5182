//! Time-bounded "avoid this (backend, model) pair" map.
//!
//! Entries are keyed per backend *and* model: the same backend can be cooling
//! down for one model while staying usable for another. Expired entries are
//! logically absent immediately; physical removal happens lazily in
//! [`CooldownTracker::cleanup`], which the server runs on a periodic sweep.

use crate::time::{Clock, MonotonicClock};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Composite cooldown key, textual `"backend/model"`.
pub fn cooldown_key(backend: &str, model: &str) -> String {
    format!("{backend}/{model}")
}

#[derive(Debug)]
pub struct CooldownTracker {
    entries: RwLock<HashMap<String, u64>>,
    clock: Arc<dyn Clock>,
}

impl Default for CooldownTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { entries: RwLock::new(HashMap::new()), clock }
    }

    /// True iff a live entry exists. Read-side only; concurrent readers do
    /// not block each other.
    pub fn is_cooling_down(&self, backend: &str, model: &str) -> bool {
        let now = self.clock.now_millis();
        let entries = self.entries.read().expect("CooldownTracker.is_cooling_down: lock poisoned");
        entries.get(&cooldown_key(backend, model)).is_some_and(|expiry| now < *expiry)
    }

    /// Insert or overwrite the entry with `expiry = now + duration`.
    pub fn set_cooldown(&self, backend: &str, model: &str, duration: Duration) {
        let expiry = self.clock.now_millis().saturating_add(duration.as_millis() as u64);
        let mut entries = self.entries.write().expect("CooldownTracker.set_cooldown: lock poisoned");
        entries.insert(cooldown_key(backend, model), expiry);
        tracing::debug!(backend, model, ?duration, "backend placed in cooldown");
    }

    pub fn remove(&self, backend: &str, model: &str) {
        let mut entries = self.entries.write().expect("CooldownTracker.remove: lock poisoned");
        entries.remove(&cooldown_key(backend, model));
    }

    /// Drop all expired entries; returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries.write().expect("CooldownTracker.cleanup: lock poisoned");
        let before = entries.len();
        entries.retain(|_, expiry| now < *expiry);
        before - entries.len()
    }

    /// Number of live (unexpired) entries.
    pub fn active_count(&self) -> usize {
        let now = self.clock.now_millis();
        let entries = self.entries.read().expect("CooldownTracker.active_count: lock poisoned");
        entries.values().filter(|expiry| now < **expiry).count()
    }

    /// Remaining cooldown for a key, if live.
    pub fn remaining_ttl(&self, backend: &str, model: &str) -> Option<Duration> {
        let now = self.clock.now_millis();
        let entries = self.entries.read().expect("CooldownTracker.remaining_ttl: lock poisoned");
        entries
            .get(&cooldown_key(backend, model))
            .filter(|expiry| now < **expiry)
            .map(|expiry| Duration::from_millis(expiry - now))
    }

    /// Live entries with their remaining TTLs, sorted by key.
    pub fn snapshot(&self) -> Vec<(String, Duration)> {
        let now = self.clock.now_millis();
        let entries = self.entries.read().expect("CooldownTracker.snapshot: lock poisoned");
        let mut live: Vec<(String, Duration)> = entries
            .iter()
            .filter(|(_, expiry)| now < **expiry)
            .map(|(key, expiry)| (key.clone(), Duration::from_millis(expiry - now)))
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0));
        live
    }
}
