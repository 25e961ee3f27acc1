use hive_core::{DispatchOutcome, MetricsBackend};
use hive_model::TaskState;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
    proto::MetricFamily,
};

#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    task_transitions: IntCounterVec,
    dispatches: IntCounterVec,
    stats_dropped: IntCounter,
    slaves_registered: IntGauge,
    slaves_healthy: IntGauge,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Registers the collectors into an existing registry.
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let task_transitions = IntCounterVec::new(
            Opts::new("hive_task_transitions_total", "Tasks entering a state"),
            &["state"],
        )?;
        let dispatches = IntCounterVec::new(
            Opts::new("hive_dispatch_total", "ExecuteTask calls by outcome"),
            &["outcome"],
        )?;
        let stats_dropped = IntCounter::new(
            "hive_stats_dropped_total",
            "Stats samples dropped on a full buffer",
        )?;
        let slaves_registered = IntGauge::new("hive_slaves_registered", "Registered slaves")?;
        let slaves_healthy = IntGauge::new("hive_slaves_healthy", "Slaves not in error/offline")?;

        registry.register(Box::new(task_transitions.clone()))?;
        registry.register(Box::new(dispatches.clone()))?;
        registry.register(Box::new(stats_dropped.clone()))?;
        registry.register(Box::new(slaves_registered.clone()))?;
        registry.register(Box::new(slaves_healthy.clone()))?;

        Ok(Self {
            registry,
            task_transitions,
            dispatches,
            stats_dropped,
            slaves_registered,
            slaves_healthy,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Renders every metric in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl MetricsBackend for PrometheusMetrics {
    fn record_task_transition(&self, state: TaskState) {
        self.task_transitions
            .with_label_values(&[state.as_str()])
            .inc();
    }

    fn record_dispatch(&self, outcome: DispatchOutcome) {
        self.dispatches.with_label_values(&[outcome.as_str()]).inc();
    }

    fn record_stats_dropped(&self) {
        self.stats_dropped.inc();
    }

    fn set_slave_counts(&self, registered: usize, healthy: usize) {
        self.slaves_registered.set(registered as i64);
        self.slaves_healthy.set(healthy as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_encodes() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.record_task_transition(TaskState::Running);
        metrics.record_task_transition(TaskState::Running);
        metrics.record_dispatch(DispatchOutcome::TimedOut);
        metrics.record_stats_dropped();
        metrics.set_slave_counts(3, 2);

        assert_eq!(
            metrics
                .task_transitions
                .with_label_values(&["running"])
                .get(),
            2
        );

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("hive_dispatch_total{outcome=\"timeout\"} 1"));
        assert!(text.contains("hive_stats_dropped_total 1"));
        assert!(text.contains("hive_slaves_registered 3"));
        assert!(text.contains("hive_slaves_healthy 2"));
    }

    #[test]
    fn shared_registry_rejects_duplicates() {
        let registry = Registry::new();
        PrometheusMetrics::with_registry(registry.clone()).unwrap();
        assert!(PrometheusMetrics::with_registry(registry).is_err());
    }
}
