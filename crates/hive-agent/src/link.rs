use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use hive_api::{
    MasterServiceClient,
    proto::{self, RegisterResult},
};
use hive_core::{CompletionReport, jobs};
use taskvisor::TaskSpec;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::{config::AgentConfig, error::AgentError, service::SlaveAgent};

/// Opens a lazy channel to the master; nothing is dialled until the first call.
pub(crate) fn connect(cfg: &AgentConfig) -> Result<MasterServiceClient<Channel>, AgentError> {
    let channel = Endpoint::from_shared(cfg.master_endpoint.clone())?
        .connect_timeout(cfg.rpc_timeout)
        .timeout(cfg.rpc_timeout)
        .connect_lazy();
    Ok(MasterServiceClient::new(channel))
}

/// Keeps a slave registered and alive on the master.
///
/// Registration and heartbeats run as supervised jobs: a failed attempt is
/// retried with backoff. A heartbeat the master answers with `ok = false`
/// (it restarted, or evicted the slave) triggers a fresh registration.
/// Finished sub-tasks are reported as they arrive.
#[derive(Clone)]
pub struct MasterLink {
    agent: SlaveAgent,
    client: MasterServiceClient<Channel>,
    registered: Arc<AtomicBool>,
}

impl MasterLink {
    pub fn new(agent: SlaveAgent) -> Result<Self, AgentError> {
        let client = connect(agent.config())?;
        Ok(Self {
            agent,
            client,
            registered: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A handle on the same channel, for the stats reporter.
    pub fn client(&self) -> MasterServiceClient<Channel> {
        self.client.clone()
    }

    /// Registers, retrying with backoff. Returns the heartbeat interval the
    /// master advertised, or `None` if `token` was cancelled first.
    pub async fn register(&self, token: &CancellationToken) -> Option<Duration> {
        let (tx, mut rx) = watch::channel(None);
        let tx = Arc::new(tx);
        let stop = token.child_token();

        let link = self.clone();
        let task = jobs::job("master-register", stop.clone(), move || {
            let link = link.clone();
            let tx = Arc::clone(&tx);
            async move {
                let interval = link.try_register().await.map_err(|e| e.to_string())?;
                info!(slave_id = %link.agent.slave_id(), ?interval, "registered with master");
                tx.send_replace(Some(interval));
                Ok(())
            }
        });
        let cfg = self.agent.config();
        let retry = cfg.register_retry;
        let handle = jobs::spawn(
            vec![jobs::until_success(
                task,
                jobs::backoff(retry, retry * 8),
                Some(cfg.rpc_timeout * 2),
            )],
            stop.clone(),
        );

        let interval = tokio::select! {
            _ = token.cancelled() => None,
            seen = rx.wait_for(Option::is_some) => seen.ok().and_then(|v| *v),
        };
        stop.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "registration job panicked");
        }
        interval
    }

    async fn try_register(&self) -> Result<Duration, AgentError> {
        let reply = self
            .client
            .clone()
            .register_slave(self.agent.info())
            .await?
            .into_inner();
        if reply.success {
            self.registered.store(true, Ordering::Release);
            return Ok(Duration::from_secs(reply.heartbeat_interval.max(1) as u64));
        }

        match reply.result() {
            RegisterResult::Stale => {
                debug!("clearing entry left by an earlier run");
                self.unregister("re-register").await;
            }
            RegisterResult::Conflict => {
                warn!(slave_id = %self.agent.slave_id(), "slave ID is held by another endpoint");
            }
            _ => {}
        }
        Err(AgentError::Rejected(reply.message))
    }

    /// Sends one heartbeat; `Ok(false)` means the master no longer knows this slave.
    async fn heartbeat(&self) -> Result<bool, AgentError> {
        let status = self.agent.status();
        let request = proto::HeartbeatRequest {
            slave_id: self.agent.slave_id().to_string(),
            timestamp: status.timestamp,
            status: Some(status),
        };
        let reply = self.client.clone().heartbeat(request).await?.into_inner();
        if !reply.ok {
            debug!(message = %reply.message, "heartbeat refused");
        }
        Ok(reply.ok)
    }

    /// One heartbeat pass; registers again if the master lost this slave.
    async fn beat(&self) -> Result<(), AgentError> {
        if self.registered.load(Ordering::Acquire) && self.heartbeat().await? {
            return Ok(());
        }
        self.registered.store(false, Ordering::Release);
        warn!("master lost this slave, registering again");
        let interval = self.try_register().await?;
        info!(?interval, "registered with master again");
        Ok(())
    }

    fn heartbeat_job(&self, interval: Duration, stop: CancellationToken) -> TaskSpec {
        let link = self.clone();
        let task = jobs::job("master-heartbeat", stop, move || {
            let link = link.clone();
            async move { link.beat().await.map_err(|e| e.to_string()) }
        });
        jobs::periodic(
            task,
            interval,
            jobs::backoff(interval, interval * 4),
            Some(self.agent.config().rpc_timeout * 2),
        )
    }

    async fn report_completion(&self, report: CompletionReport) {
        let task_id = report.task_id.clone();
        match self
            .client
            .clone()
            .report_task_completion(proto::TaskCompletionRequest::from(report))
            .await
        {
            Ok(reply) if reply.get_ref().acknowledged => {
                debug!(%task_id, "completion acknowledged");
            }
            Ok(reply) => {
                warn!(%task_id, message = %reply.into_inner().message, "completion not acknowledged");
            }
            Err(e) => warn!(%task_id, error = %e, "completion report failed"),
        }
    }

    async fn unregister(&self, reason: &str) {
        let request = proto::UnregisterRequest {
            slave_id: self.agent.slave_id().to_string(),
            reason: reason.to_string(),
        };
        match self.client.clone().unregister_slave(request).await {
            Ok(reply) if reply.get_ref().success => info!(reason, "unregistered from master"),
            Ok(reply) => debug!(message = %reply.into_inner().message, "unregister refused"),
            Err(e) => warn!(error = %e, "unregister failed"),
        }
    }

    /// Registers, then heartbeats and forwards completions until `token` is
    /// cancelled; finally flushes pending completions and unregisters.
    pub async fn run(
        self,
        mut completions: mpsc::Receiver<CompletionReport>,
        token: CancellationToken,
    ) -> Result<(), AgentError> {
        let Some(interval) = self.register(&token).await else {
            return Ok(());
        };
        let beats = jobs::spawn(vec![self.heartbeat_job(interval, token.clone())], token.clone());

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(report) = completions.recv() => self.report_completion(report).await,
            }
        }
        if let Err(e) = beats.await {
            warn!(error = %e, "heartbeat job panicked");
        }

        while let Ok(report) = completions.try_recv() {
            self.report_completion(report).await;
        }
        self.unregister("shutdown").await;
        Ok(())
    }
}
