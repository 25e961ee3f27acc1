use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use hive_model::SlaveStats;
use taskvisor::TaskSpec;
use tokio::sync::{
    Mutex as AsyncMutex,
    mpsc::{self, error::TrySendError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{DataAggregator, MetricsBackend, jobs};

const DROP_WARN_EVERY: Duration = Duration::from_secs(1);

/// Bounded ingestion of slave stat reports.
///
/// [`collect`](Self::collect) never waits: when the buffer is full the sample
/// is dropped. A single consumer drains the buffer into the latest-sample
/// cache and the [`DataAggregator`].
pub struct StatsCollector {
    tx: mpsc::Sender<SlaveStats>,
    rx: AsyncMutex<mpsc::Receiver<SlaveStats>>,
    latest: DashMap<String, SlaveStats>,
    aggregator: Arc<DataAggregator>,
    metrics: Arc<dyn MetricsBackend>,
    dropped: AtomicU64,
    last_drop_warn: Mutex<Option<Instant>>,
}

impl StatsCollector {
    pub fn new(
        buffer: usize,
        aggregator: Arc<DataAggregator>,
        metrics: Arc<dyn MetricsBackend>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        Self {
            tx,
            rx: AsyncMutex::new(rx),
            latest: DashMap::new(),
            aggregator,
            metrics,
            dropped: AtomicU64::new(0),
            last_drop_warn: Mutex::new(None),
        }
    }

    /// Enqueues a sample; returns `false` if it was dropped.
    pub fn collect(&self, stats: SlaveStats) -> bool {
        match self.tx.try_send(stats) {
            Ok(()) => true,
            Err(TrySendError::Full(stats)) | Err(TrySendError::Closed(stats)) => {
                self.on_drop(&stats);
                false
            }
        }
    }

    fn on_drop(&self, stats: &SlaveStats) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.record_stats_dropped();

        let mut last = self
            .last_drop_warn
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let due = match *last {
            Some(at) => now.duration_since(at) >= DROP_WARN_EVERY,
            None => true,
        };
        if due {
            *last = Some(now);
            warn!(
                slave_id = %stats.slave_id,
                task_id = %stats.task_id,
                dropped_total = total,
                "stats buffer full, dropping samples"
            );
        }
    }

    /// Applies one sample to the cache and the aggregator.
    pub fn ingest(&self, stats: SlaveStats) {
        self.latest.insert(stats.slave_id.clone(), stats.clone());
        self.aggregator.add(stats);
    }

    /// The consumer as a supervised job. It holds the receiver while it
    /// runs; a restart after a failure picks it up again.
    pub fn consume_job(self: &Arc<Self>, stop: CancellationToken) -> TaskSpec {
        let collector = Arc::clone(self);
        let task = jobs::job("stats-consumer", stop, move || {
            let collector = Arc::clone(&collector);
            async move {
                let mut rx = collector.rx.lock().await;
                while let Some(stats) = rx.recv().await {
                    collector.ingest(stats);
                }
                Err("stats channel closed".to_string())
            }
        });
        jobs::until_success(
            task,
            jobs::backoff(Duration::from_millis(100), Duration::from_secs(5)),
            None,
        )
    }

    /// Ingests whatever is buffered without waiting. Returns the number of
    /// samples applied, or zero while the consumer holds the receiver.
    pub fn drain(&self) -> usize {
        let Ok(mut rx) = self.rx.try_lock() else {
            return 0;
        };
        let mut applied = 0;
        while let Ok(stats) = rx.try_recv() {
            self.ingest(stats);
            applied += 1;
        }
        if applied > 0 {
            debug!(applied, "stats buffer drained");
        }
        applied
    }

    /// Drops everything known about the given tasks.
    pub fn forget_tasks(&self, task_ids: &[String]) {
        if task_ids.is_empty() {
            return;
        }
        for id in task_ids {
            self.aggregator.clear(id);
        }
        self.latest.retain(|_, s| !task_ids.contains(&s.task_id));
        debug!(tasks = task_ids.len(), "task stats evicted");
    }

    /// Drops the latest sample of a slave that left.
    pub fn forget_slave(&self, slave_id: &str) {
        self.latest.remove(slave_id);
    }

    /// Latest sample reported by a slave, for any task.
    pub fn latest(&self, slave_id: &str) -> Option<SlaveStats> {
        self.latest.get(slave_id).map(|s| s.value().clone())
    }

    /// Latest sample of `slave_id` for `task_id`.
    pub fn slave_stats(&self, task_id: &str, slave_id: &str) -> Option<SlaveStats> {
        self.aggregator
            .get_aggregation(task_id)
            .and_then(|mut agg| agg.by_slave.remove(slave_id))
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn aggregator(&self) -> &Arc<DataAggregator> {
        &self.aggregator
    }
}
