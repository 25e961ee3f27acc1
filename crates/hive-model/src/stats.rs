use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::SystemTime};

use crate::time_serde;

/// Cumulative counters one slave reports for one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SlaveStats {
    pub task_id: String,
    pub slave_id: String,
    pub total_requests: u64,
    pub success_requests: u64,
    pub failed_requests: u64,
    /// Percent, 0-100.
    pub success_rate: f64,
    /// Latencies in milliseconds.
    pub avg_latency: f64,
    pub min_latency: f64,
    pub max_latency: f64,
    pub p50_latency: f64,
    pub p90_latency: f64,
    pub p95_latency: f64,
    pub p99_latency: f64,
    pub qps: f64,
    pub status_codes: HashMap<i32, u64>,
    pub error_types: HashMap<String, u64>,
    /// Unix seconds of the sample, `0` if the slave did not stamp it.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(with = "time_serde")]
    pub start: SystemTime,
    #[serde(with = "time_serde")]
    pub end: SystemTime,
}

/// Task-wide rollup computed from the latest sample of every slave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedStats {
    pub task_id: String,
    pub time_range: TimeRange,
    pub total_agents: usize,
    pub total_requests: u64,
    pub success_requests: u64,
    pub failed_requests: u64,
    /// Percent, 0-100.
    pub success_rate: f64,
    pub avg_latency: f64,
    pub min_latency: f64,
    pub max_latency: f64,
    pub p50_latency: f64,
    pub p90_latency: f64,
    pub p95_latency: f64,
    pub p99_latency: f64,
    pub total_qps: f64,
    pub by_slave: HashMap<String, SlaveStats>,
    pub status_codes: HashMap<i32, u64>,
    pub error_types: HashMap<String, u64>,
}
