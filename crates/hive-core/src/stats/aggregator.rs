use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
    time::SystemTime,
};

use hive_model::{AggregatedStats, SlaveStats, TimeRange};

/// Task ID used for samples that carry none.
pub const DEFAULT_TASK_ID: &str = "default";
/// Task ID of the combined cross-task view.
pub const COMBINED_TASK_ID: &str = "all";

/// Latest sample of every slave for one task.
#[derive(Debug, Clone)]
struct TaskAggregation {
    started: SystemTime,
    last_update: SystemTime,
    by_slave: HashMap<String, SlaveStats>,
}

/// Per-task rollup of slave reports.
///
/// Only the latest sample per slave is kept; every read recomputes totals
/// and percentiles from those snapshots, so repeated cumulative reports from
/// one slave are never double counted.
#[derive(Default)]
pub struct DataAggregator {
    tasks: RwLock<HashMap<String, TaskAggregation>>,
}

impl DataAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, stats: SlaveStats) {
        let task_id = if stats.task_id.is_empty() {
            DEFAULT_TASK_ID.to_string()
        } else {
            stats.task_id.clone()
        };
        let now = SystemTime::now();

        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let agg = tasks.entry(task_id).or_insert_with(|| TaskAggregation {
            started: now,
            last_update: now,
            by_slave: HashMap::new(),
        });
        agg.last_update = now;
        agg.by_slave.insert(stats.slave_id.clone(), stats);
    }

    pub fn get_aggregation(&self, task_id: &str) -> Option<AggregatedStats> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        tasks.get(task_id).map(|agg| {
            build(
                task_id,
                TimeRange {
                    start: agg.started,
                    end: agg.last_update,
                },
                agg.by_slave.clone(),
            )
        })
    }

    pub fn get_all_aggregations(&self) -> HashMap<String, AggregatedStats> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        tasks
            .iter()
            .map(|(id, agg)| {
                let range = TimeRange {
                    start: agg.started,
                    end: agg.last_update,
                };
                (id.clone(), build(id, range, agg.by_slave.clone()))
            })
            .collect()
    }

    /// One view over every task: counts and QPS summed, per-slave maps
    /// merged, rates and latencies recomputed from the merged samples.
    pub fn combined(&self) -> Option<AggregatedStats> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        let start = tasks.values().map(|a| a.started).min()?;
        let end = tasks.values().map(|a| a.last_update).max()?;

        let mut merged: HashMap<String, SlaveStats> = HashMap::new();
        for agg in tasks.values() {
            for (slave_id, stats) in &agg.by_slave {
                let key = if tasks.len() == 1 {
                    slave_id.clone()
                } else {
                    format!("{}/{}", stats.task_id, slave_id)
                };
                merged.insert(key, stats.clone());
            }
        }
        Some(build(COMBINED_TASK_ID, TimeRange { start, end }, merged))
    }

    /// Drops a task's samples; a no-op for unknown tasks.
    pub fn clear(&self, task_id: &str) {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);
    }

}

fn build(task_id: &str, time_range: TimeRange, by_slave: HashMap<String, SlaveStats>) -> AggregatedStats {
    let mut out = AggregatedStats {
        task_id: task_id.to_string(),
        time_range,
        total_agents: by_slave.len(),
        total_requests: 0,
        success_requests: 0,
        failed_requests: 0,
        success_rate: 0.0,
        avg_latency: 0.0,
        min_latency: 0.0,
        max_latency: 0.0,
        p50_latency: 0.0,
        p90_latency: 0.0,
        p95_latency: 0.0,
        p99_latency: 0.0,
        total_qps: 0.0,
        by_slave: HashMap::new(),
        status_codes: HashMap::new(),
        error_types: HashMap::new(),
    };

    let mut latencies = Vec::with_capacity(by_slave.len() * 3);
    for stats in by_slave.values() {
        out.total_requests += stats.total_requests;
        out.success_requests += stats.success_requests;
        out.failed_requests += stats.failed_requests;
        out.total_qps += stats.qps;
        for (code, count) in &stats.status_codes {
            *out.status_codes.entry(*code).or_insert(0) += count;
        }
        for (kind, count) in &stats.error_types {
            *out.error_types.entry(kind.clone()).or_insert(0) += count;
        }
        latencies.extend([stats.avg_latency, stats.p95_latency, stats.p99_latency]);
    }

    if out.total_requests > 0 {
        out.success_rate = out.success_requests as f64 / out.total_requests as f64 * 100.0;
    }

    if !latencies.is_empty() {
        latencies.sort_by(f64::total_cmp);
        out.min_latency = latencies[0];
        out.max_latency = latencies[latencies.len() - 1];
        out.avg_latency = latencies.iter().sum::<f64>() / latencies.len() as f64;
        out.p50_latency = percentile(&latencies, 50.0);
        out.p90_latency = percentile(&latencies, 90.0);
        out.p95_latency = percentile(&latencies, 95.0);
        out.p99_latency = percentile(&latencies, 99.0);
    }

    out.by_slave = by_slave;
    out
}

/// Linear-interpolated percentile over an ascending slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}
