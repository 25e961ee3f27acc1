//! Master-side orchestration engine.
//!
//! - [`SlaveRegistry`] and [`HealthChecker`] track which slaves exist and are alive.
//! - [`selector`] and [`splitter`] decide where a task runs and with how many workers.
//! - [`TaskQueue`] is the task state machine.
//! - [`Master`] dispatches sub-tasks through a [`SlaveConnector`] and reconciles the outcome.
//! - [`StatsCollector`] and [`DataAggregator`] turn slave reports into task-wide numbers.
//! - [`jobs`] runs the periodic background work under a taskvisor supervisor.

mod error;
pub use error::CoreError;

mod config;
pub use config::{ConfigError, MasterConfig};

pub mod jobs;

pub mod metrics;
pub use metrics::{DispatchOutcome, MetricsBackend, NoopMetrics};

pub mod registry;
pub use registry::SlaveRegistry;

pub mod health;
pub use health::{HealthChecker, SweepReport};

pub mod selector;
pub use selector::{SlaveSelector, selector_for};

pub mod splitter;
pub use splitter::{TaskSplitter, splitter_for};

pub mod queue;
pub use queue::TaskQueue;

pub mod stats;
pub use stats::{DataAggregator, StatsCollector};

pub mod master;
pub use master::{
    CompletionReport, ExecuteAck, ExecuteRequest, Master, MasterStatus, ReportedStatus,
    SlaveConnector, StartAllReport,
};
