use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::SystemTime,
};

use async_trait::async_trait;
use hive_core::ExecuteRequest;
use hive_model::{SlaveStats, time_serde};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;

/// The single-node load generator behind a slave.
///
/// `run` drives one sub-task to the end, or until `cancel` fires, and pushes
/// cumulative samples into `stats` while it runs. Returning `Ok` reports the
/// sub-task as succeeded.
#[async_trait]
pub trait LoadEngine: Send + Sync + 'static {
    async fn run(
        &self,
        task: ExecuteRequest,
        stats: StatsSink,
        cancel: CancellationToken,
    ) -> Result<(), AgentError>;
}

/// Non-blocking handle an engine reports samples through.
#[derive(Clone)]
pub struct StatsSink {
    slave_id: Arc<str>,
    task_id: Arc<str>,
    tx: mpsc::Sender<SlaveStats>,
    dropped: Arc<AtomicU64>,
    requests: Arc<AtomicU64>,
}

impl StatsSink {
    pub(crate) fn new(
        slave_id: Arc<str>,
        task_id: &str,
        tx: mpsc::Sender<SlaveStats>,
        dropped: Arc<AtomicU64>,
        requests: Arc<AtomicU64>,
    ) -> Self {
        Self {
            slave_id,
            task_id: Arc::from(task_id),
            tx,
            dropped,
            requests,
        }
    }

    /// A standalone sink and its receiver, for driving an engine outside an agent.
    pub fn channel(
        slave_id: &str,
        task_id: &str,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<SlaveStats>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self::new(
            Arc::from(slave_id),
            task_id,
            tx,
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
        );
        (sink, rx)
    }

    /// Queues a sample stamped with this slave and task. Returns `false` if
    /// the buffer was full and the sample was dropped.
    pub fn report(&self, mut stats: SlaveStats) -> bool {
        stats.slave_id = self.slave_id.to_string();
        stats.task_id = self.task_id.to_string();
        if stats.timestamp == 0 {
            stats.timestamp = time_serde::to_unix(SystemTime::now());
        }
        self.requests.store(stats.total_requests, Ordering::Relaxed);
        match self.tx.try_send(stats) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}
