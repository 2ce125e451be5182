//! Backend selection within a candidate list.
//!
//! All strategies consider enabled backends only and return `None` iff no
//! enabled candidate exists. `Weighted` prefers the lowest priority;
//! `RoundRobin` rotates through candidates with an atomic cursor; `Random`
//! and `LeastRequests` draw uniformly.

use crate::routes::Route;
use rand::Rng;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Random,
    #[default]
    RoundRobin,
    LeastRequests,
    Weighted,
}

#[derive(Debug, Default)]
pub struct LoadBalancer {
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index into `routes` of the chosen candidate, or `None` when no route
    /// has an enabled backend.
    pub fn select(&self, strategy: Strategy, routes: &[Route]) -> Option<usize> {
        let enabled: Vec<usize> = routes
            .iter()
            .enumerate()
            .filter(|(_, route)| route.backend.enabled)
            .map(|(i, _)| i)
            .collect();
        if enabled.is_empty() {
            return None;
        }
        let pick = match strategy {
            Strategy::Weighted => {
                let best = enabled
                    .iter()
                    .copied()
                    .min_by_key(|i| routes[*i].priority)
                    .unwrap_or(enabled[0]);
                return Some(best);
            }
            Strategy::RoundRobin => self.cursor.fetch_add(1, Ordering::Relaxed) % enabled.len(),
            Strategy::Random | Strategy::LeastRequests => {
                rand::rng().random_range(0..enabled.len())
            }
        };
        Some(enabled[pick])
    }
}
