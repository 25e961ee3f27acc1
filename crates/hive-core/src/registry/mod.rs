use std::{sync::Arc, time::SystemTime};

use dashmap::{DashMap, mapref::entry::Entry};
use hive_model::{ResourceUsage, SlaveFilter, SlaveInfo, SlaveState};
use tracing::{debug, info};

use crate::{CoreError, selector::SlaveSelector};

/// In-memory registry of slaves keyed by slave ID.
///
/// Every mutation is a read-copy-update on a single entry under the map's
/// per-shard lock, so updates to one slave are linearizable while different
/// slaves never contend on a shared lock. Reads return owned copies.
pub struct SlaveRegistry {
    slaves: DashMap<String, SlaveInfo>,
    selector: Arc<dyn SlaveSelector>,
}

impl SlaveRegistry {
    pub fn new(selector: Arc<dyn SlaveSelector>) -> Self {
        Self {
            slaves: DashMap::new(),
            selector,
        }
    }

    /// Adds a slave as `Idle` with fresh heartbeat and registration times.
    pub fn register(&self, mut info: SlaveInfo) -> Result<(), CoreError> {
        match self.slaves.entry(info.id.clone()) {
            Entry::Occupied(_) => Err(CoreError::AlreadyRegistered(info.id)),
            Entry::Vacant(entry) => {
                let now = SystemTime::now();
                info.state = SlaveState::Idle;
                info.running_tasks.clear();
                info.last_heartbeat = now;
                info.registered_at = now;
                info!(
                    slave_id = %info.id,
                    endpoint = %info.endpoint(),
                    region = %info.region,
                    cpu_cores = info.cpu_cores,
                    "slave registered"
                );
                entry.insert(info);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, id: &str) -> Result<SlaveInfo, CoreError> {
        let (_, info) = self
            .slaves
            .remove(id)
            .ok_or_else(|| CoreError::SlaveNotFound(id.to_string()))?;
        info!(slave_id = %id, "slave unregistered");
        Ok(info)
    }

    pub fn get(&self, id: &str) -> Option<SlaveInfo> {
        self.slaves.get(id).map(|entry| entry.value().clone())
    }

    /// All slaves, ordered by ID.
    pub fn get_all(&self) -> Vec<SlaveInfo> {
        let mut all: Vec<SlaveInfo> = self.slaves.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Slaves not in `Error` or `Offline`.
    pub fn get_healthy(&self) -> Vec<SlaveInfo> {
        self.get_matching(|s| !s.state.is_unhealthy())
    }

    pub fn get_idle(&self) -> Vec<SlaveInfo> {
        self.get_matching(|s| s.state == SlaveState::Idle)
    }

    fn get_matching(&self, pred: impl Fn(&SlaveInfo) -> bool) -> Vec<SlaveInfo> {
        let mut out: Vec<SlaveInfo> = self
            .slaves
            .iter()
            .filter(|e| pred(e.value()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Picks `count` healthy slaves with the configured selector.
    pub fn select(&self, count: usize) -> Vec<SlaveInfo> {
        self.selector.select(self.get_healthy(), count)
    }

    /// Picks `count` slaves among those passing `filter`.
    pub fn select_with_filter(&self, count: usize, filter: &SlaveFilter) -> Vec<SlaveInfo> {
        let candidates = filter.apply(self.get_all());
        debug!(
            candidates = candidates.len(),
            count,
            selector = self.selector.name(),
            "selecting slaves"
        );
        self.selector.select(candidates, count)
    }

    /// Applies `f` to a copy of the entry and stores the result.
    ///
    /// The entry stays locked for the duration of `f`; an error leaves the
    /// stored value untouched.
    fn update<F>(&self, id: &str, f: F) -> Result<SlaveInfo, CoreError>
    where
        F: FnOnce(SlaveInfo) -> Result<SlaveInfo, CoreError>,
    {
        let mut entry = self
            .slaves
            .get_mut(id)
            .ok_or_else(|| CoreError::SlaveNotFound(id.to_string()))?;
        let updated = f(entry.value().clone())?;
        *entry.value_mut() = updated.clone();
        Ok(updated)
    }

    /// Sets the state verbatim.
    pub fn update_slave_state(&self, id: &str, state: SlaveState) -> Result<(), CoreError> {
        self.update(id, |mut s| {
            s.state = state;
            Ok(s)
        })?;
        Ok(())
    }

    /// Stores a resource snapshot and re-derives load and state from it.
    pub fn update_resource_usage(&self, id: &str, usage: ResourceUsage) -> Result<(), CoreError> {
        self.update(id, |mut s| {
            s.current_load = (usage.cpu_percent / 100.0).clamp(0.0, 1.0);
            s.resource_usage = Some(usage);
            s.refresh_state();
            Ok(s)
        })?;
        Ok(())
    }

    /// Applies a status carried by a heartbeat.
    ///
    /// Stopping and unhealthy states reported by the slave are taken verbatim.
    /// Any other report proves the slave is live, so a stale `Stopping` or
    /// `Unreachable` is cleared and the state is re-derived from `usage`.
    pub fn apply_reported_status(
        &self,
        id: &str,
        reported: SlaveState,
        usage: ResourceUsage,
    ) -> Result<SlaveState, CoreError> {
        let updated = self.update(id, |mut s| {
            s.current_load = (usage.cpu_percent / 100.0).clamp(0.0, 1.0);
            s.resource_usage = Some(usage);
            match reported {
                SlaveState::Stopping | SlaveState::Error | SlaveState::Offline => {
                    s.state = reported;
                }
                _ => {
                    if matches!(s.state, SlaveState::Stopping | SlaveState::Unreachable) {
                        s.state = SlaveState::Idle;
                    }
                    s.refresh_state();
                }
            }
            Ok(s)
        })?;
        Ok(updated.state)
    }

    /// Records that the slave accepted `task_id`. Adding a task twice is a no-op.
    pub fn add_task(&self, id: &str, task_id: &str) -> Result<(), CoreError> {
        self.update(id, |mut s| {
            if s.running_tasks.iter().any(|t| t == task_id) {
                return Ok(s);
            }
            if s.is_at_capacity() {
                return Err(CoreError::SlaveAtCapacity(s.id));
            }
            s.running_tasks.push(task_id.to_string());
            s.refresh_state();
            Ok(s)
        })?;
        Ok(())
    }

    pub fn remove_task(&self, id: &str, task_id: &str) -> Result<(), CoreError> {
        self.update(id, |mut s| {
            s.running_tasks.retain(|t| t != task_id);
            s.refresh_state();
            Ok(s)
        })?;
        Ok(())
    }

    pub fn update_heartbeat(&self, id: &str) -> Result<(), CoreError> {
        self.update_heartbeat_at(id, SystemTime::now())
    }

    pub fn update_heartbeat_at(&self, id: &str, at: SystemTime) -> Result<(), CoreError> {
        self.update(id, |mut s| {
            s.last_heartbeat = at;
            Ok(s)
        })?;
        Ok(())
    }

    /// Brings an `Error`/`Offline` slave back; returns `true` if it was restored.
    pub fn mark_healthy(&self, id: &str) -> Result<bool, CoreError> {
        let mut restored = false;
        self.update(id, |mut s| {
            if s.state.is_unhealthy() {
                s.state = SlaveState::Idle;
                s.refresh_state();
                restored = true;
            }
            Ok(s)
        })?;
        Ok(restored)
    }

    /// Moves the slave to `Error`; returns `true` if the state changed.
    pub fn mark_unhealthy(&self, id: &str) -> Result<bool, CoreError> {
        let mut changed = false;
        self.update(id, |mut s| {
            changed = s.state != SlaveState::Error;
            s.state = SlaveState::Error;
            Ok(s)
        })?;
        Ok(changed)
    }

    pub fn count(&self) -> usize {
        self.slaves.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{LeastLoadedSelector, LocationAwareSelector};

    fn registry() -> SlaveRegistry {
        SlaveRegistry::new(Arc::new(LeastLoadedSelector))
    }

    #[test]
    fn register_and_get() {
        let reg = registry();
        let mut info = SlaveInfo::new("s1").with_region("us");
        info.state = SlaveState::Error;
        reg.register(info).unwrap();

        let got = reg.get("s1").expect("slave should exist");
        assert_eq!(got.state, SlaveState::Idle);
        assert_eq!(got.region, "us");
        assert_eq!(got.last_heartbeat, got.registered_at);
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn duplicate_register_fails() {
        let reg = registry();
        reg.register(SlaveInfo::new("s1")).unwrap();
        assert_eq!(
            reg.register(SlaveInfo::new("s1")),
            Err(CoreError::AlreadyRegistered("s1".into()))
        );
    }

    #[test]
    fn unknown_slave_operations_fail() {
        let reg = registry();
        let missing = CoreError::SlaveNotFound("nope".into());

        assert_eq!(reg.unregister("nope").unwrap_err(), missing);
        assert_eq!(reg.add_task("nope", "t1"), Err(missing.clone()));
        assert_eq!(reg.update_heartbeat("nope"), Err(missing.clone()));
        assert_eq!(reg.mark_unhealthy("nope"), Err(missing));
    }

    #[test]
    fn snapshots_are_independent() {
        let reg = registry();
        reg.register(SlaveInfo::new("s1")).unwrap();

        let mut copy = reg.get("s1").unwrap();
        copy.running_tasks.push("t1".into());
        copy.state = SlaveState::Busy;

        let stored = reg.get("s1").unwrap();
        assert!(stored.running_tasks.is_empty());
        assert_eq!(stored.state, SlaveState::Idle);
    }

    #[test]
    fn add_and_remove_task_derive_state() {
        let reg = registry();
        reg.register(SlaveInfo::new("s1").with_max_concurrency(2))
            .unwrap();

        reg.add_task("s1", "t1").unwrap();
        assert_eq!(reg.get("s1").unwrap().state, SlaveState::Busy);

        reg.add_task("s1", "t1").unwrap();
        assert_eq!(reg.get("s1").unwrap().running_tasks.len(), 1);

        reg.add_task("s1", "t2").unwrap();
        assert_eq!(reg.get("s1").unwrap().state, SlaveState::Overloaded);

        assert_eq!(
            reg.add_task("s1", "t3"),
            Err(CoreError::SlaveAtCapacity("s1".into()))
        );
        assert_eq!(reg.get("s1").unwrap().running_tasks.len(), 2);

        reg.remove_task("s1", "t1").unwrap();
        reg.remove_task("s1", "t2").unwrap();
        assert_eq!(reg.get("s1").unwrap().state, SlaveState::Idle);
    }

    #[test]
    fn resource_usage_sets_load_and_state() {
        let reg = registry();
        reg.register(SlaveInfo::new("s1").with_max_concurrency(4))
            .unwrap();

        reg.update_resource_usage(
            "s1",
            ResourceUsage {
                cpu_percent: 95.0,
                active_tasks: 1,
                ..Default::default()
            },
        )
        .unwrap();

        let s = reg.get("s1").unwrap();
        assert_eq!(s.state, SlaveState::Overloaded);
        assert!((s.current_load - 0.95).abs() < 1e-9);
    }

    #[test]
    fn healthy_excludes_error_and_offline() {
        let reg = registry();
        for id in ["a", "b", "c"] {
            reg.register(SlaveInfo::new(id)).unwrap();
        }
        assert!(reg.mark_unhealthy("a").unwrap());
        assert!(!reg.mark_unhealthy("a").unwrap());
        reg.update_slave_state("b", SlaveState::Offline).unwrap();

        let healthy: Vec<_> = reg.get_healthy().into_iter().map(|s| s.id).collect();
        assert_eq!(healthy, vec!["c".to_string()]);

        assert!(reg.mark_healthy("a").unwrap());
        assert!(!reg.mark_healthy("c").unwrap());
        assert_eq!(reg.get_idle().len(), 2);
    }

    #[test]
    fn select_with_filter_uses_selector() {
        let reg = SlaveRegistry::new(Arc::new(LocationAwareSelector::new(vec!["us".into()])));
        reg.register(SlaveInfo::new("eu-1").with_region("eu")).unwrap();
        reg.register(SlaveInfo::new("us-1").with_region("us")).unwrap();
        reg.register(SlaveInfo::new("us-2").with_region("us")).unwrap();
        reg.mark_unhealthy("us-2").unwrap();

        let picked = reg.select_with_filter(2, &SlaveFilter::available());
        let ids: Vec<_> = picked.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["us-1", "eu-1"]);
    }

    #[test]
    fn reported_status_clears_stopping() {
        let reg = registry();
        reg.register(SlaveInfo::new("s1")).unwrap();

        let state = reg
            .apply_reported_status("s1", SlaveState::Stopping, ResourceUsage::default())
            .unwrap();
        assert_eq!(state, SlaveState::Stopping);

        let busy = ResourceUsage {
            cpu_percent: 95.0,
            active_tasks: 1,
            ..Default::default()
        };
        let state = reg
            .apply_reported_status("s1", SlaveState::Running, busy)
            .unwrap();
        assert_eq!(state, SlaveState::Overloaded);
        assert!((reg.get("s1").unwrap().current_load - 0.95).abs() < 1e-9);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let reg = Arc::new(registry());
        reg.register(SlaveInfo::new("s1").with_max_concurrency(0))
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        reg.add_task("s1", &format!("t-{i}-{j}")).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(reg.get("s1").unwrap().running_tasks.len(), 400);
    }
}
