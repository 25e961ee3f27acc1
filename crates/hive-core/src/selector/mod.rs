//! Slave selection strategies.
//!
//! Every selector honours the same contract: with `count >= candidates.len()`
//! all candidates come back unchanged, otherwise exactly `count` distinct
//! candidates are returned.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use hive_model::{SelectStrategy, SlaveInfo};
use rand::seq::SliceRandom;

pub trait SlaveSelector: Send + Sync + 'static {
    fn select(&self, candidates: Vec<SlaveInfo>, count: usize) -> Vec<SlaveInfo>;

    fn name(&self) -> &'static str;
}

/// Builds the selector for a configured strategy.
pub fn selector_for(
    strategy: SelectStrategy,
    preferred_regions: &[String],
) -> Arc<dyn SlaveSelector> {
    match strategy {
        SelectStrategy::Random => Arc::new(RandomSelector),
        SelectStrategy::LeastLoaded => Arc::new(LeastLoadedSelector),
        SelectStrategy::LocationAware => {
            Arc::new(LocationAwareSelector::new(preferred_regions.to_vec()))
        }
        SelectStrategy::RoundRobin => Arc::new(RoundRobinSelector::new()),
    }
}

/// Uniform random pick via Fisher-Yates shuffle.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelector;

impl SlaveSelector for RandomSelector {
    fn select(&self, mut candidates: Vec<SlaveInfo>, count: usize) -> Vec<SlaveInfo> {
        if count >= candidates.len() {
            return candidates;
        }
        candidates.shuffle(&mut rand::rng());
        candidates.truncate(count);
        candidates
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Lowest `current_load` first; ties keep candidate order.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLoadedSelector;

impl SlaveSelector for LeastLoadedSelector {
    fn select(&self, mut candidates: Vec<SlaveInfo>, count: usize) -> Vec<SlaveInfo> {
        if count >= candidates.len() {
            return candidates;
        }
        candidates.sort_by(|a, b| a.current_load.total_cmp(&b.current_load));
        candidates.truncate(count);
        candidates
    }

    fn name(&self) -> &'static str {
        "least-loaded"
    }
}

/// Slaves in preferred regions first, the rest fill the remainder.
#[derive(Debug, Default, Clone)]
pub struct LocationAwareSelector {
    preferred_regions: Vec<String>,
}

impl LocationAwareSelector {
    pub fn new(preferred_regions: Vec<String>) -> Self {
        Self { preferred_regions }
    }
}

impl SlaveSelector for LocationAwareSelector {
    fn select(&self, candidates: Vec<SlaveInfo>, count: usize) -> Vec<SlaveInfo> {
        if count >= candidates.len() {
            return candidates;
        }
        let (mut preferred, other): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|s| self.preferred_regions.contains(&s.region));
        preferred.extend(other);
        preferred.truncate(count);
        preferred
    }

    fn name(&self) -> &'static str {
        "location-aware"
    }
}

/// Consecutive candidates from a shared cursor.
///
/// The cursor is an atomic counter, so one instance can serve concurrent
/// dispatchers; each call claims its own `count` positions.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    cursor: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SlaveSelector for RoundRobinSelector {
    fn select(&self, candidates: Vec<SlaveInfo>, count: usize) -> Vec<SlaveInfo> {
        let len = candidates.len();
        if count >= len {
            return candidates;
        }
        let start = self.cursor.fetch_add(count, Ordering::Relaxed) % len;
        candidates
            .into_iter()
            .cycle()
            .skip(start)
            .take(count)
            .collect()
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}
