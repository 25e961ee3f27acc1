use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{SlaveInfo, SlaveState};

/// Declarative predicate narrowing the slave candidate set.
///
/// Empty lists and zero limits mean "no constraint". The filter is
/// stateless and built per selection request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SlaveFilter {
    pub include_ids: Vec<String>,
    pub exclude_ids: Vec<String>,
    pub include_regions: Vec<String>,
    pub exclude_regions: Vec<String>,
    /// Every pair must be present on the slave.
    pub include_labels: HashMap<String, String>,
    /// No pair may be present on the slave.
    pub exclude_labels: HashMap<String, String>,
    pub required_states: Vec<SlaveState>,
    pub excluded_states: Vec<SlaveState>,
    pub min_cpu_cores: u32,
    pub min_memory: u64,
    pub max_cpu_percent: f64,
    pub max_memory_percent: f64,
    pub max_load: f64,
    pub max_active_tasks: u32,
    /// Permit slaves that already run tasks.
    pub allow_reuse: bool,
    /// Order idle slaves ahead of busy ones before selection.
    pub prefer_idle: bool,
}

impl SlaveFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Healthy slaves with spare capacity, idle first.
    pub fn available() -> Self {
        Self {
            excluded_states: vec![SlaveState::Error, SlaveState::Offline],
            allow_reuse: true,
            prefer_idle: true,
            ..Self::default()
        }
    }

    pub fn with_ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.include_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.include_regions.push(region.into());
        self
    }

    pub fn with_required_state(mut self, state: SlaveState) -> Self {
        self.required_states.push(state);
        self
    }

    pub fn with_allow_reuse(mut self, allow: bool) -> Self {
        self.allow_reuse = allow;
        self
    }

    pub fn with_prefer_idle(mut self, prefer: bool) -> Self {
        self.prefer_idle = prefer;
        self
    }

    pub fn is_slave_valid(&self, slave: &SlaveInfo) -> bool {
        if !self.include_ids.is_empty() && !self.include_ids.contains(&slave.id) {
            return false;
        }
        if self.exclude_ids.contains(&slave.id) {
            return false;
        }

        if !self.include_regions.is_empty() && !self.include_regions.contains(&slave.region) {
            return false;
        }
        if self.exclude_regions.contains(&slave.region) {
            return false;
        }

        let has_label = |k: &String, v: &String| slave.labels.get(k) == Some(v);
        if !self.include_labels.iter().all(|(k, v)| has_label(k, v)) {
            return false;
        }
        if self.exclude_labels.iter().any(|(k, v)| has_label(k, v)) {
            return false;
        }

        if !self.required_states.is_empty() && !self.required_states.contains(&slave.state) {
            return false;
        }
        if self.excluded_states.contains(&slave.state) {
            return false;
        }

        if slave.cpu_cores < self.min_cpu_cores || slave.memory < self.min_memory {
            return false;
        }

        if let Some(usage) = &slave.resource_usage {
            if self.max_cpu_percent > 0.0 && usage.cpu_percent > self.max_cpu_percent {
                return false;
            }
            if self.max_memory_percent > 0.0 && usage.memory_percent > self.max_memory_percent {
                return false;
            }
            if self.max_load > 0.0 && usage.load_average > self.max_load {
                return false;
            }
            if self.max_active_tasks > 0 && usage.active_tasks > self.max_active_tasks {
                return false;
            }
        }

        if !self.allow_reuse && !slave.running_tasks.is_empty() {
            return false;
        }

        !slave.is_at_capacity()
    }

    /// Applies the filter, moving idle slaves first when `prefer_idle` is set.
    pub fn apply(&self, slaves: Vec<SlaveInfo>) -> Vec<SlaveInfo> {
        let filtered: Vec<SlaveInfo> = slaves
            .into_iter()
            .filter(|s| self.is_slave_valid(s))
            .collect();

        if !self.prefer_idle {
            return filtered;
        }

        let (idle, busy): (Vec<_>, Vec<_>) = filtered
            .into_iter()
            .partition(|s| s.state == SlaveState::Idle || s.running_tasks.is_empty());
        idle.into_iter().chain(busy).collect()
    }
}
