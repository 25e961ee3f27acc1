use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use dashmap::DashMap;
use futures::future::join_all;
use hive_model::SlaveInfo;
use taskvisor::TaskSpec;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{CoreError, SlaveRegistry, jobs};

/// Outcome of one health sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    /// Slaves whose heartbeat was older than the timeout.
    pub late: Vec<String>,
    /// Slaves moved to `Error` by this sweep.
    pub marked_unhealthy: Vec<String>,
    /// Slaves restored from `Error`/`Offline` by this sweep.
    pub restored: Vec<String>,
}

enum Verdict {
    Fresh { restored: bool },
    Late { newly_unhealthy: bool },
    Gone,
}

/// Periodic liveness sweep over the registry.
///
/// Failure counters live in their own map so a sweep never holds a registry
/// entry longer than a single update.
pub struct HealthChecker {
    registry: Arc<SlaveRegistry>,
    failures: DashMap<String, u32>,
    interval: Duration,
    timeout: Duration,
    max_failures: u32,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<SlaveRegistry>,
        interval: Duration,
        timeout: Duration,
        max_failures: u32,
    ) -> Self {
        Self {
            registry,
            failures: DashMap::new(),
            interval,
            timeout,
            max_failures: max_failures.max(1),
        }
    }

    /// Current consecutive-failure count of a slave.
    pub fn failure_count(&self, slave_id: &str) -> u32 {
        self.failures.get(slave_id).map(|c| *c).unwrap_or(0)
    }

    /// Records a heartbeat: refreshes liveness, resets the failure counter
    /// and restores an errored slave.
    pub fn record_heartbeat(&self, slave_id: &str) -> Result<(), CoreError> {
        self.registry.update_heartbeat(slave_id)?;
        self.failures.remove(slave_id);
        if self.registry.mark_healthy(slave_id)? {
            info!(slave_id, "slave recovered");
        }
        Ok(())
    }

    /// Drops the counter of an unregistered slave.
    pub fn forget(&self, slave_id: &str) {
        self.failures.remove(slave_id);
    }

    /// Checks every registered slave against `now`.
    pub async fn sweep(&self, now: SystemTime) -> SweepReport {
        let slaves = self.registry.get_all();
        let verdicts = join_all(slaves.iter().map(|s| self.check(s, now))).await;

        let mut report = SweepReport {
            checked: slaves.len(),
            ..Default::default()
        };
        for (slave, verdict) in slaves.into_iter().zip(verdicts) {
            match verdict {
                Verdict::Fresh { restored: true } => report.restored.push(slave.id),
                Verdict::Fresh { restored: false } | Verdict::Gone => {}
                Verdict::Late { newly_unhealthy } => {
                    if newly_unhealthy {
                        report.marked_unhealthy.push(slave.id.clone());
                    }
                    report.late.push(slave.id);
                }
            }
        }
        report
    }

    async fn check(&self, slave: &SlaveInfo, now: SystemTime) -> Verdict {
        let age = now
            .duration_since(slave.last_heartbeat)
            .unwrap_or(Duration::ZERO);

        if age <= self.timeout {
            self.failures.remove(&slave.id);
            return match self.registry.mark_healthy(&slave.id) {
                Ok(restored) => {
                    if restored {
                        info!(slave_id = %slave.id, "slave recovered");
                    }
                    Verdict::Fresh { restored }
                }
                Err(_) => Verdict::Gone,
            };
        }

        let failures = {
            let mut count = self.failures.entry(slave.id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        debug!(
            slave_id = %slave.id,
            failures,
            age_ms = age.as_millis() as u64,
            "heartbeat overdue"
        );

        if failures < self.max_failures {
            return Verdict::Late {
                newly_unhealthy: false,
            };
        }

        match self.registry.mark_unhealthy(&slave.id) {
            Ok(changed) => {
                if changed {
                    warn!(
                        slave_id = %slave.id,
                        failures,
                        last_heartbeat_age_s = age.as_secs(),
                        "slave marked unhealthy"
                    );
                }
                Verdict::Late {
                    newly_unhealthy: changed,
                }
            }
            Err(_) => {
                self.failures.remove(&slave.id);
                Verdict::Gone
            }
        }
    }

    /// The sweep as a periodic job, run every `interval` until `stop` is
    /// cancelled.
    pub fn sweep_job(self: &Arc<Self>, stop: CancellationToken) -> TaskSpec {
        let checker = Arc::clone(self);
        let task = jobs::job("health-sweep", stop, move || {
            let checker = Arc::clone(&checker);
            async move {
                let report = checker.sweep(SystemTime::now()).await;
                if !report.late.is_empty() {
                    debug!(checked = report.checked, late = report.late.len(), "health sweep");
                }
                Ok(())
            }
        });
        jobs::periodic(
            task,
            self.interval,
            jobs::backoff(self.interval, self.interval * 4),
            Some(self.timeout.max(self.interval)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::LeastLoadedSelector;
    use hive_model::SlaveState;

    fn setup(max_failures: u32) -> (Arc<SlaveRegistry>, HealthChecker) {
        let registry = Arc::new(SlaveRegistry::new(Arc::new(LeastLoadedSelector)));
        let checker = HealthChecker::new(
            Arc::clone(&registry),
            Duration::from_secs(1),
            Duration::from_secs(1),
            max_failures,
        );
        (registry, checker)
    }

    #[tokio::test]
    async fn missed_heartbeats_mark_error_then_heartbeat_restores() {
        let (registry, checker) = setup(3);
        registry.register(SlaveInfo::new("s1")).unwrap();

        let mut now = SystemTime::now();
        for expected in 1..=2u32 {
            now += Duration::from_secs(2);
            let report = checker.sweep(now).await;
            assert_eq!(report.late, vec!["s1".to_string()]);
            assert!(report.marked_unhealthy.is_empty());
            assert_eq!(checker.failure_count("s1"), expected);
            assert_eq!(registry.get("s1").unwrap().state, SlaveState::Idle);
        }

        now += Duration::from_secs(2);
        let report = checker.sweep(now).await;
        assert_eq!(report.marked_unhealthy, vec!["s1".to_string()]);
        assert_eq!(registry.get("s1").unwrap().state, SlaveState::Error);
        assert!(registry.get_healthy().is_empty());

        checker.record_heartbeat("s1").unwrap();
        assert_eq!(checker.failure_count("s1"), 0);
        assert_eq!(registry.get("s1").unwrap().state, SlaveState::Idle);
    }

    #[tokio::test]
    async fn fresh_heartbeat_seen_by_sweep_restores() {
        let (registry, checker) = setup(1);
        registry.register(SlaveInfo::new("s1")).unwrap();

        let late = SystemTime::now() + Duration::from_secs(5);
        checker.sweep(late).await;
        assert_eq!(registry.get("s1").unwrap().state, SlaveState::Error);

        registry.update_heartbeat_at("s1", late).unwrap();
        let report = checker.sweep(late).await;
        assert_eq!(report.restored, vec!["s1".to_string()]);
        assert_eq!(checker.failure_count("s1"), 0);
        assert_eq!(registry.get("s1").unwrap().state, SlaveState::Idle);
    }

    #[tokio::test]
    async fn unhealthy_is_reported_once() {
        let (registry, checker) = setup(1);
        registry.register(SlaveInfo::new("s1")).unwrap();

        let late = SystemTime::now() + Duration::from_secs(5);
        assert_eq!(checker.sweep(late).await.marked_unhealthy.len(), 1);
        assert!(checker.sweep(late).await.marked_unhealthy.is_empty());
        assert_eq!(checker.failure_count("s1"), 2);
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_slave_fails() {
        let (_registry, checker) = setup(3);
        assert_eq!(
            checker.record_heartbeat("ghost"),
            Err(CoreError::SlaveNotFound("ghost".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_job_marks_silent_slave() {
        let (registry, checker) = setup(2);
        registry.register(SlaveInfo::new("s1")).unwrap();
        registry
            .update_heartbeat_at("s1", SystemTime::now() - Duration::from_secs(60))
            .unwrap();
        let checker = Arc::new(checker);

        let stop = CancellationToken::new();
        let handle = jobs::spawn(vec![checker.sweep_job(stop.clone())], stop.clone());
        tokio::time::sleep(Duration::from_millis(2500)).await;
        stop.cancel();
        handle.await.unwrap();

        assert_eq!(registry.get("s1").unwrap().state, SlaveState::Error);
    }
}
