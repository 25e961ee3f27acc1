//! Metrics seam for the orchestration engine.
//!
//! The core only reports events; exporting them is left to a backend such
//! as `hive-prometheus`. [`NoopMetrics`] is used when nothing is plugged in.

use hive_model::TaskState;

/// Result of one `ExecuteTask` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Accepted,
    Rejected,
    Failed,
    TimedOut,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Accepted => "accepted",
            DispatchOutcome::Rejected => "rejected",
            DispatchOutcome::Failed => "failed",
            DispatchOutcome::TimedOut => "timeout",
        }
    }
}

pub trait MetricsBackend: Send + Sync + 'static {
    /// A task entered `state`.
    fn record_task_transition(&self, state: TaskState);

    fn record_dispatch(&self, outcome: DispatchOutcome);

    /// A stats sample was dropped because the ingestion buffer was full.
    fn record_stats_dropped(&self);

    fn set_slave_counts(&self, registered: usize, healthy: usize);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsBackend for NoopMetrics {
    fn record_task_transition(&self, _state: TaskState) {}

    fn record_dispatch(&self, _outcome: DispatchOutcome) {}

    fn record_stats_dropped(&self) {}

    fn set_slave_counts(&self, _registered: usize, _healthy: usize) {}
}
