//! Domain types shared by the hive master, agents and API layers.
//!
//! Everything here is plain data: the master's registry and queue own the
//! live copies and hand out clones.

mod error;
pub use error::ModelError;

mod slave;
pub use slave::{ResourceUsage, SlaveInfo, SlaveState};

mod filter;
pub use filter::SlaveFilter;

mod task;
pub use task::{SubTask, Task, TaskConfig, TaskStartOptions, TaskState};

mod query;
pub use query::{QueueStats, TaskPage, TaskQuery};

mod stats;
pub use stats::{AggregatedStats, SlaveStats, TimeRange};

mod strategy;
pub use strategy::{SelectStrategy, SplitStrategy};

pub mod time_serde;

/// Metadata key recording why a task failed.
pub const META_FAILURE_REASON: &str = "failure_reason";
/// Metadata key recording the task a retry was created from.
pub const META_RETRY_FROM: &str = "retry_from";
/// Metadata key recording the state of the task a retry was created from.
pub const META_RETRY_REASON: &str = "retry_reason";
