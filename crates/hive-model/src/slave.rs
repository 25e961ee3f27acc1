use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr, time::SystemTime};

use crate::{ModelError, time_serde};

/// CPU or memory usage above this percentage marks a slave overloaded.
pub const OVERLOAD_PERCENT: f64 = 90.0;

/// Lifecycle state of a slave as seen by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SlaveState {
    /// Registered and not executing anything.
    Idle,
    /// Executing work (explicitly reported by the slave).
    Running,
    /// Draining after a stop request.
    Stopping,
    /// Executing work with spare capacity.
    Busy,
    /// At task capacity or over the resource threshold.
    Overloaded,
    /// Missed too many heartbeats.
    Error,
    /// Known to be down.
    Offline,
    /// RPC to the slave failed.
    Unreachable,
}

impl SlaveState {
    /// Returns `true` for states that exclude a slave from selection.
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, SlaveState::Error | SlaveState::Offline)
    }

    /// States set by liveness tracking rather than derived from load.
    fn is_sticky(&self) -> bool {
        matches!(
            self,
            SlaveState::Error | SlaveState::Offline | SlaveState::Unreachable | SlaveState::Stopping
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SlaveState::Idle => "idle",
            SlaveState::Running => "running",
            SlaveState::Stopping => "stopping",
            SlaveState::Busy => "busy",
            SlaveState::Overloaded => "overloaded",
            SlaveState::Error => "error",
            SlaveState::Offline => "offline",
            SlaveState::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for SlaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SlaveState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(SlaveState::Idle),
            "running" => Ok(SlaveState::Running),
            "stopping" => Ok(SlaveState::Stopping),
            "busy" => Ok(SlaveState::Busy),
            "overloaded" => Ok(SlaveState::Overloaded),
            "error" => Ok(SlaveState::Error),
            "offline" => Ok(SlaveState::Offline),
            "unreachable" => Ok(SlaveState::Unreachable),
            _ => Err(ModelError::UnknownSlaveState(s.to_string())),
        }
    }
}

/// Resource snapshot reported by a slave.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// CPU usage, 0-100.
    pub cpu_percent: f64,
    /// Memory usage, 0-100.
    pub memory_percent: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub active_tasks: u32,
    pub queued_tasks: u32,
    pub load_average: f64,
    pub network_in_mbps: f64,
    pub network_out_mbps: f64,
}

/// A slave node known to the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaveInfo {
    pub id: String,
    pub hostname: String,
    /// Address the master dials for slave RPCs.
    pub ip: String,
    pub grpc_port: u16,
    pub cpu_cores: u32,
    /// Total memory in bytes.
    pub memory: u64,
    pub version: String,
    pub region: String,
    pub labels: HashMap<String, String>,
    pub state: SlaveState,
    /// Task IDs the slave currently executes, in acceptance order.
    pub running_tasks: Vec<String>,
    /// Upper bound on `running_tasks`; `0` means unbounded.
    pub max_concurrency: u32,
    /// Normalized load, 0-1.
    pub current_load: f64,
    pub total_requests: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
    #[serde(with = "time_serde")]
    pub last_heartbeat: SystemTime,
    #[serde(with = "time_serde")]
    pub registered_at: SystemTime,
}

impl SlaveInfo {
    pub fn new(id: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            id: id.into(),
            hostname: String::new(),
            ip: "127.0.0.1".to_string(),
            grpc_port: 0,
            cpu_cores: 1,
            memory: 0,
            version: String::new(),
            region: String::new(),
            labels: HashMap::new(),
            state: SlaveState::Idle,
            running_tasks: Vec::new(),
            max_concurrency: 1,
            current_load: 0.0,
            total_requests: 0,
            resource_usage: None,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn with_endpoint(mut self, ip: impl Into<String>, port: u16) -> Self {
        self.ip = ip.into();
        self.grpc_port = port;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_cpu_cores(mut self, cores: u32) -> Self {
        self.cpu_cores = cores;
        self
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory = bytes;
        self
    }

    pub fn with_max_concurrency(mut self, max: u32) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_load(mut self, load: f64) -> Self {
        self.current_load = load;
        self
    }

    /// URI of the slave's RPC service.
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.ip, self.grpc_port)
    }

    /// Active task count: the larger of what the master tracks and what the
    /// slave last reported.
    pub fn active_tasks(&self) -> usize {
        let reported = self
            .resource_usage
            .as_ref()
            .map(|u| u.active_tasks as usize)
            .unwrap_or(0);
        self.running_tasks.len().max(reported)
    }

    pub fn is_at_capacity(&self) -> bool {
        self.max_concurrency > 0 && self.running_tasks.len() >= self.max_concurrency as usize
    }

    /// Recomputes `state` from the task count and resource usage.
    ///
    /// Liveness states (error, offline, unreachable, stopping) are left alone;
    /// only health tracking moves a slave out of them.
    pub fn refresh_state(&mut self) {
        if self.state.is_sticky() {
            return;
        }

        let active = self.active_tasks();
        let (cpu, mem) = self
            .resource_usage
            .as_ref()
            .map(|u| (u.cpu_percent, u.memory_percent))
            .unwrap_or((0.0, 0.0));

        self.state = if active == 0 {
            SlaveState::Idle
        } else if (self.max_concurrency > 0 && active >= self.max_concurrency as usize)
            || cpu > OVERLOAD_PERCENT
            || mem > OVERLOAD_PERCENT
        {
            SlaveState::Overloaded
        } else {
            SlaveState::Busy
        };
    }
}
