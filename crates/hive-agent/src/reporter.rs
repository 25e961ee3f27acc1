use std::{collections::HashMap, sync::Arc, time::Duration};

use hive_api::{MasterServiceClient, proto};
use hive_core::jobs;
use hive_model::SlaveStats;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, warn};

use crate::error::AgentError;

/// Streams buffered engine samples to the master's `ReportStats`.
///
/// Samples are cumulative, so each flush sends only the newest one per task.
pub struct StatsReporter {
    rx: AsyncMutex<mpsc::Receiver<SlaveStats>>,
    interval: Duration,
}

impl StatsReporter {
    pub fn new(rx: mpsc::Receiver<SlaveStats>, interval: Duration) -> Self {
        Self {
            rx: AsyncMutex::new(rx),
            interval,
        }
    }

    /// Flushes every interval until `token` is cancelled, then once more.
    pub async fn run(self, mut client: MasterServiceClient<Channel>, token: CancellationToken) {
        let reporter = Arc::new(self);
        let flusher = {
            let reporter = Arc::clone(&reporter);
            let client = client.clone();
            jobs::job("stats-flush", token.clone(), move || {
                let reporter = Arc::clone(&reporter);
                let mut client = client.clone();
                async move {
                    let batch = reporter.drain().await;
                    flush(&mut client, batch)
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }
            })
        };
        let every = reporter.interval;
        let spec = jobs::periodic(flusher, every, jobs::backoff(every, every * 4), None);
        if let Err(e) = jobs::spawn(vec![spec], token).await {
            warn!(error = %e, "stats flush job panicked");
        }

        let batch = reporter.drain().await;
        if let Err(e) = flush(&mut client, batch).await {
            debug!(error = %e, "final stats flush failed");
        }
        debug!("stats reporter stopped");
    }

    /// Takes everything buffered, keeping the newest sample per task.
    pub(crate) async fn drain(&self) -> Vec<SlaveStats> {
        let mut rx = self.rx.lock().await;
        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, SlaveStats> = HashMap::new();
        while let Ok(stats) = rx.try_recv() {
            if !latest.contains_key(&stats.task_id) {
                order.push(stats.task_id.clone());
            }
            latest.insert(stats.task_id.clone(), stats);
        }
        order
            .into_iter()
            .filter_map(|id| latest.remove(&id))
            .collect()
    }
}

/// Sends one batch over a client stream. An empty batch is a no-op.
pub(crate) async fn flush(
    client: &mut MasterServiceClient<Channel>,
    batch: Vec<SlaveStats>,
) -> Result<Option<proto::StatsAck>, AgentError> {
    if batch.is_empty() {
        return Ok(None);
    }
    let sent = batch.len();
    let stream = tokio_stream::iter(batch.into_iter().map(proto::StatsData::from));
    let ack = client.report_stats(stream).await?.into_inner();
    if ack.dropped > 0 {
        warn!(sent, dropped = ack.dropped, "master dropped stats samples");
    }
    Ok(Some(ack))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(task: &str, total: u64) -> SlaveStats {
        SlaveStats {
            task_id: task.into(),
            slave_id: "s1".into(),
            total_requests: total,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn drain_keeps_newest_per_task() {
        let (tx, rx) = mpsc::channel(16);
        let reporter = StatsReporter::new(rx, Duration::from_secs(1));

        for s in [sample("a", 1), sample("b", 5), sample("a", 3), sample("a", 9)] {
            tx.send(s).await.unwrap();
        }
        let batch = reporter.drain().await;
        let got: Vec<(String, u64)> = batch
            .into_iter()
            .map(|s| (s.task_id, s.total_requests))
            .collect();
        assert_eq!(got, vec![("a".to_string(), 9), ("b".to_string(), 5)]);

        assert!(reporter.drain().await.is_empty());
    }
}
