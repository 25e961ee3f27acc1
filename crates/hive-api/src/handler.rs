use std::collections::HashMap;

use async_trait::async_trait;
use hive_model::{
    AggregatedStats, QueueStats, SlaveInfo, SlaveStats, Task, TaskConfig, TaskPage, TaskQuery,
    TaskStartOptions,
};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Master overview returned by the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusView {
    pub slave_count: usize,
    pub healthy_slaves: usize,
    pub tasks: QueueStats,
}

/// Live stats across every task that reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveStatsView {
    /// `None` until the first sample arrives.
    pub combined: Option<AggregatedStats>,
    /// Rollup per task ID.
    pub tasks: HashMap<String, AggregatedStats>,
}

/// Admin operations served over HTTP.
///
/// [`MasterApiAdapter`](crate::MasterApiAdapter) delegates to a
/// [`hive_core::Master`]; custom handlers can wrap it with auth or auditing.
#[async_trait]
pub trait ApiHandler: Send + Sync + 'static {
    async fn list_tasks(&self, query: TaskQuery) -> Result<TaskPage<Task>, ApiError>;

    /// Queues a task built from `config`, starting it if `auto_start`.
    async fn create_task(&self, config: TaskConfig, auto_start: bool) -> Result<Task, ApiError>;

    async fn get_task(&self, id: &str) -> Result<Task, ApiError>;

    async fn stop_task(&self, id: &str) -> Result<Task, ApiError>;

    /// Starts a pending task; the returned task reflects the dispatch outcome.
    async fn start_task(&self, id: &str, options: TaskStartOptions) -> Result<Task, ApiError>;

    /// Queues a copy of a finished task and returns the copy.
    async fn retry_task(&self, id: &str) -> Result<Task, ApiError>;

    async fn task_stats(&self, id: &str) -> Result<AggregatedStats, ApiError>;

    async fn slave_task_stats(&self, task_id: &str, slave_id: &str)
    -> Result<SlaveStats, ApiError>;

    async fn live_stats(&self) -> Result<LiveStatsView, ApiError>;

    /// Latest sample a slave reported, whichever task it belongs to.
    async fn slave_stats(&self, slave_id: &str) -> Result<SlaveStats, ApiError>;

    async fn list_slaves(&self) -> Result<Vec<SlaveInfo>, ApiError>;

    async fn get_slave(&self, id: &str) -> Result<SlaveInfo, ApiError>;

    async fn status(&self) -> Result<StatusView, ApiError>;
}
