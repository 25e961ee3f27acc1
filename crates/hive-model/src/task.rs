use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr, time::SystemTime};

use crate::{META_FAILURE_REASON, ModelError, time_serde};

/// Default stats report interval handed to slaves, in seconds.
pub const DEFAULT_REPORT_INTERVAL_SECS: u32 = 1;

/// Execution state of a load-test task.
///
/// Allowed edges: `Pending -> Running`, `Pending -> Stopped`,
/// `Running -> Completed | Failed | Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    /// Queued, waiting to be started.
    Pending,
    /// Dispatched to at least one slave.
    Running,
    /// Every slave finished successfully.
    Completed,
    /// Dispatch or execution failed.
    Failed,
    /// Stopped by an operator.
    Stopped,
}

impl TaskState {
    /// Returns `true` if the task won't transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Stopped
        )
    }

    /// Returns `true` if the task is pending or running.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskState::Pending),
            "running" => Ok(TaskState::Running),
            "completed" | "complete" => Ok(TaskState::Completed),
            "failed" => Ok(TaskState::Failed),
            "stopped" => Ok(TaskState::Stopped),
            _ => Err(ModelError::UnknownTaskState(s.to_string())),
        }
    }
}

/// Task definition as submitted by an operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskConfig {
    pub protocol: String,
    pub target: String,
    /// Total workers across all slaves.
    pub worker_count: u32,
    pub duration_secs: u64,
    pub ramp_up_secs: u64,
    /// Opaque engine configuration, forwarded to slaves untouched.
    pub config_data: Vec<u8>,
    pub report_interval_secs: u32,
    pub metadata: HashMap<String, String>,
}

/// A load-test task tracked by the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub protocol: String,
    pub target: String,
    pub total_workers: u32,
    pub duration_secs: u64,
    pub ramp_up_secs: u64,
    #[serde(default)]
    pub config_data: Vec<u8>,
    pub report_interval_secs: u32,
    pub state: TaskState,
    /// Slaves a sub-task was built for.
    #[serde(default)]
    pub assigned_slaves: Vec<String>,
    #[serde(with = "time_serde")]
    pub created_at: SystemTime,
    #[serde(default, with = "time_serde::option", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<SystemTime>,
    #[serde(default, with = "time_serde::option", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<SystemTime>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Task {
    pub fn new(id: impl Into<String>, total_workers: u32) -> Self {
        Self {
            id: id.into(),
            protocol: String::new(),
            target: String::new(),
            total_workers,
            duration_secs: 0,
            ramp_up_secs: 0,
            config_data: Vec::new(),
            report_interval_secs: DEFAULT_REPORT_INTERVAL_SECS,
            state: TaskState::Pending,
            assigned_slaves: Vec::new(),
            created_at: SystemTime::now(),
            started_at: None,
            completed_at: None,
            metadata: HashMap::new(),
        }
    }

    pub fn from_config(id: impl Into<String>, cfg: TaskConfig) -> Self {
        let mut task = Self::new(id, cfg.worker_count);
        task.protocol = cfg.protocol;
        task.target = cfg.target;
        task.duration_secs = cfg.duration_secs;
        task.ramp_up_secs = cfg.ramp_up_secs;
        task.config_data = cfg.config_data;
        if cfg.report_interval_secs > 0 {
            task.report_interval_secs = cfg.report_interval_secs;
        }
        task.metadata = cfg.metadata;
        task
    }

    /// Extracts the parts of the task a retry copies.
    pub fn to_config(&self) -> TaskConfig {
        TaskConfig {
            protocol: self.protocol.clone(),
            target: self.target.clone(),
            worker_count: self.total_workers,
            duration_secs: self.duration_secs,
            ramp_up_secs: self.ramp_up_secs,
            config_data: self.config_data.clone(),
            report_interval_secs: self.report_interval_secs,
            metadata: HashMap::new(),
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.metadata.get(META_FAILURE_REASON).map(String::as_str)
    }
}

/// The share of a task assigned to one slave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTask {
    pub task_id: String,
    pub sub_task_id: String,
    pub slave_id: String,
    pub worker_count: u32,
    #[serde(default)]
    pub config: Vec<u8>,
}

/// Optional slave targeting for a manual task start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskStartOptions {
    /// Explicit slave IDs; takes precedence over `slave_region`.
    pub slave_ids: Vec<String>,
    pub slave_region: Option<String>,
}

impl TaskStartOptions {
    pub fn is_empty(&self) -> bool {
        self.slave_ids.is_empty() && self.slave_region.as_deref().is_none_or(str::is_empty)
    }
}
