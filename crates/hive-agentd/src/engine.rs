use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use hive_agent::{AgentError, LoadEngine, StatsSink};
use hive_core::ExecuteRequest;
use hive_model::SlaveStats;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const LATENCY_WINDOW: usize = 5_000;
const LATENCY_SAMPLES_PER_TICK: u64 = 200;

/// Synthetic engine: sends no traffic, only produces plausible samples.
///
/// Useful to exercise a master and its slaves without a real load
/// generator. A `duration_secs` of zero runs until the task is stopped.
pub struct DemoEngine {
    per_worker_rps: f64,
}

impl DemoEngine {
    pub fn new(per_worker_rps: f64) -> Self {
        Self { per_worker_rps }
    }
}

#[derive(Default)]
struct Totals {
    requests: u64,
    failed: u64,
    latencies: VecDeque<f64>,
    status_codes: HashMap<i32, u64>,
    error_types: HashMap<String, u64>,
}

impl Totals {
    fn advance(&mut self, workers: f64, secs: f64, per_worker_rps: f64, rng: &mut StdRng) {
        let sent = (workers * per_worker_rps * secs * rng.random_range(0.8..1.2)) as u64;
        let failed = (sent as f64 * rng.random_range(0.0..0.02)) as u64;
        self.requests += sent;
        self.failed += failed;
        *self.status_codes.entry(200).or_insert(0) += sent - failed;
        if failed > 0 {
            *self.status_codes.entry(503).or_insert(0) += failed;
            *self.error_types.entry("unavailable".to_string()).or_insert(0) += failed;
        }

        let base = 20.0 * (1.0 + workers / 100.0);
        for _ in 0..sent.min(LATENCY_SAMPLES_PER_TICK) {
            if self.latencies.len() == LATENCY_WINDOW {
                self.latencies.pop_front();
            }
            self.latencies.push_back(base + rng.random_range(0.0..base));
        }
    }

    fn snapshot(&self, elapsed: Duration) -> SlaveStats {
        let mut sorted: Vec<f64> = self.latencies.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let pct = |p: f64| match sorted.len() {
            0 => 0.0,
            n => sorted[((p / 100.0) * (n - 1) as f64).round() as usize],
        };
        let success = self.requests - self.failed;

        SlaveStats {
            total_requests: self.requests,
            success_requests: success,
            failed_requests: self.failed,
            success_rate: if self.requests > 0 {
                success as f64 / self.requests as f64 * 100.0
            } else {
                0.0
            },
            avg_latency: if sorted.is_empty() {
                0.0
            } else {
                sorted.iter().sum::<f64>() / sorted.len() as f64
            },
            min_latency: sorted.first().copied().unwrap_or(0.0),
            max_latency: sorted.last().copied().unwrap_or(0.0),
            p50_latency: pct(50.0),
            p90_latency: pct(90.0),
            p95_latency: pct(95.0),
            p99_latency: pct(99.0),
            qps: if elapsed.is_zero() {
                0.0
            } else {
                self.requests as f64 / elapsed.as_secs_f64()
            },
            status_codes: self.status_codes.clone(),
            error_types: self.error_types.clone(),
            ..Default::default()
        }
    }
}

/// Workers active `elapsed` into a ramp-up of `ramp`.
fn active_workers(total: u32, elapsed: Duration, ramp: Duration) -> f64 {
    if ramp.is_zero() || elapsed >= ramp {
        return f64::from(total);
    }
    (f64::from(total) * elapsed.as_secs_f64() / ramp.as_secs_f64()).max(1.0)
}

#[async_trait]
impl LoadEngine for DemoEngine {
    async fn run(
        &self,
        task: ExecuteRequest,
        stats: StatsSink,
        cancel: CancellationToken,
    ) -> Result<(), AgentError> {
        if task.target.trim().is_empty() {
            return Err(AgentError::Engine("target is empty".into()));
        }
        let tick = Duration::from_secs(u64::from(task.report_interval_secs.max(1)));
        let duration = Duration::from_secs(task.duration_secs);
        let ramp = Duration::from_secs(task.ramp_up_secs);
        info!(
            task_id = %task.task_id,
            workers = task.worker_count,
            target = %task.target,
            ?duration,
            "demo load started"
        );

        let mut rng = StdRng::from_os_rng();
        let mut totals = Totals::default();
        let started = Instant::now();
        let mut ticker = tokio::time::interval_at(started + tick, tick);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    stats.report(totals.snapshot(started.elapsed()));
                    debug!(task_id = %task.task_id, "demo load cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let elapsed = started.elapsed();
                    let workers = active_workers(task.worker_count, elapsed, ramp);
                    totals.advance(workers, tick.as_secs_f64(), self.per_worker_rps, &mut rng);
                    stats.report(totals.snapshot(elapsed));

                    if !duration.is_zero() && elapsed >= duration {
                        info!(task_id = %task.task_id, requests = totals.requests, "demo load finished");
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(duration_secs: u64) -> ExecuteRequest {
        ExecuteRequest {
            task_id: "t1".into(),
            sub_task_id: "t1-s1".into(),
            worker_count: 10,
            protocol: "http".into(),
            target: "http://svc".into(),
            duration_secs,
            ramp_up_secs: 0,
            config_data: Vec::new(),
            report_interval_secs: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_for_duration_with_cumulative_samples() {
        let (sink, mut rx) = StatsSink::channel("s1", "t1", 64);
        DemoEngine::new(50.0)
            .run(request(3), sink, CancellationToken::new())
            .await
            .unwrap();

        let mut samples = Vec::new();
        while let Ok(s) = rx.try_recv() {
            samples.push(s);
        }
        assert_eq!(samples.len(), 3);
        for pair in samples.windows(2) {
            assert!(pair[1].total_requests >= pair[0].total_requests);
        }
        let last = samples.last().unwrap();
        assert!(last.total_requests > 0);
        assert_eq!(last.success_requests + last.failed_requests, last.total_requests);
        assert_eq!(last.task_id, "t1");
        assert!(last.p99_latency >= last.p50_latency);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_ends_open_ended_run() {
        let (sink, mut rx) = StatsSink::channel("s1", "t1", 64);
        let cancel = CancellationToken::new();
        let engine = DemoEngine::new(50.0);

        let run = engine.run(request(0), sink, cancel.clone());
        let stop = async {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(run, stop);
        result.unwrap();

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn empty_target_is_rejected() {
        let (sink, _rx) = StatsSink::channel("s1", "t1", 1);
        let mut req = request(1);
        req.target.clear();
        let err = DemoEngine::new(1.0)
            .run(req, sink, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Engine(_)));
    }

    #[test]
    fn ramp_up_scales_workers() {
        let ramp = Duration::from_secs(10);
        assert_eq!(active_workers(100, Duration::from_secs(5), ramp), 50.0);
        assert_eq!(active_workers(100, Duration::from_secs(20), ramp), 100.0);
        assert_eq!(active_workers(100, Duration::ZERO, Duration::ZERO), 100.0);
        assert_eq!(active_workers(4, Duration::ZERO, ramp), 1.0);
    }
}
