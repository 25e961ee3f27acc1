use async_trait::async_trait;
use hive_model::{SlaveInfo, SubTask, Task};

use crate::CoreError;

/// Payload of an `ExecuteTask` call: one sub-task plus the task fields a
/// slave needs to run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteRequest {
    pub task_id: String,
    pub sub_task_id: String,
    pub worker_count: u32,
    pub protocol: String,
    pub target: String,
    pub duration_secs: u64,
    pub ramp_up_secs: u64,
    pub config_data: Vec<u8>,
    pub report_interval_secs: u32,
}

impl ExecuteRequest {
    pub fn new(task: &Task, sub: &SubTask) -> Self {
        Self {
            task_id: task.id.clone(),
            sub_task_id: sub.sub_task_id.clone(),
            worker_count: sub.worker_count,
            protocol: task.protocol.clone(),
            target: task.target.clone(),
            duration_secs: task.duration_secs,
            ramp_up_secs: task.ramp_up_secs,
            config_data: sub.config.clone(),
            report_interval_secs: task.report_interval_secs,
        }
    }
}

/// A slave's answer to `ExecuteTask`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteAck {
    pub accepted: bool,
    pub message: String,
}

/// Transport used by the master to reach slaves.
///
/// Timeouts are applied by the caller.
#[async_trait]
pub trait SlaveConnector: Send + Sync + 'static {
    async fn execute_task(
        &self,
        slave: &SlaveInfo,
        request: ExecuteRequest,
    ) -> Result<ExecuteAck, CoreError>;

    async fn stop_task(&self, slave: &SlaveInfo, task_id: &str, force: bool)
    -> Result<(), CoreError>;

    /// Drops any cached connection to a slave that left.
    fn forget(&self, _slave_id: &str) {}
}
