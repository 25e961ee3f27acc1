use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::SystemTime,
};

use hive_api::proto::{self, slave_service_server::SlaveService};
use hive_core::{CompletionReport, ExecuteRequest};
use hive_model::{SlaveState, SlaveStats, time_serde};
use tokio::{sync::mpsc, task::AbortHandle};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::{
    config::AgentConfig,
    engine::{LoadEngine, StatsSink},
    error::AgentError,
    system::SystemSnapshot,
};

const COMPLETION_BUFFER: usize = 64;

/// Receiving ends of the agent's upstream traffic.
pub struct AgentOutbox {
    pub stats: mpsc::Receiver<SlaveStats>,
    pub completions: mpsc::Receiver<CompletionReport>,
}

struct RunningTask {
    sub_task_id: String,
    workers: u32,
    cancel: CancellationToken,
    abort: AbortHandle,
    requests: Arc<AtomicU64>,
    stop_requested: bool,
}

struct Shared {
    config: AgentConfig,
    slave_id: Arc<str>,
    engine: Arc<dyn LoadEngine>,
    running: Mutex<HashMap<String, RunningTask>>,
    stats_tx: mpsc::Sender<SlaveStats>,
    completions_tx: mpsc::Sender<CompletionReport>,
    dropped: Arc<AtomicU64>,
    finished_requests: AtomicU64,
    overrides: RwLock<HashMap<String, String>>,
    shutdown: CancellationToken,
}

/// Slave-side `SlaveService`: admits sub-tasks up to `max_concurrency` and
/// runs each on the [`LoadEngine`].
#[derive(Clone)]
pub struct SlaveAgent {
    shared: Arc<Shared>,
}

impl SlaveAgent {
    pub fn new(
        config: AgentConfig,
        engine: Arc<dyn LoadEngine>,
    ) -> Result<(Self, AgentOutbox), AgentError> {
        config.validate()?;
        let (stats_tx, stats) = mpsc::channel(config.report_buffer);
        let (completions_tx, completions) = mpsc::channel(COMPLETION_BUFFER);

        let agent = Self {
            shared: Arc::new(Shared {
                slave_id: Arc::from(config.slave_id.as_str()),
                config,
                engine,
                running: Mutex::new(HashMap::new()),
                stats_tx,
                completions_tx,
                dropped: Arc::new(AtomicU64::new(0)),
                finished_requests: AtomicU64::new(0),
                overrides: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        };
        Ok((agent, AgentOutbox { stats, completions }))
    }

    pub fn slave_id(&self) -> &str {
        &self.shared.slave_id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.shared.config
    }

    fn running(&self) -> MutexGuard<'_, HashMap<String, RunningTask>> {
        self.shared
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// IDs of the tasks currently executing, sorted.
    pub fn running_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Samples dropped because the report buffer was full.
    pub fn dropped_samples(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Settings pushed by `UpdateConfig`.
    pub fn config_overrides(&self) -> HashMap<String, String> {
        self.shared
            .overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cancels every running task; the slave then reports `Stopping`.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    /// Registration payload for the master.
    pub fn info(&self) -> proto::SlaveInfo {
        let cfg = &self.shared.config;
        let snap = SystemSnapshot::capture();
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();

        proto::SlaveInfo {
            slave_id: self.shared.slave_id.to_string(),
            hostname,
            ip: cfg.advertise_host.clone(),
            grpc_port: u32::from(cfg.advertise_port),
            cpu_cores: snap.cpu_cores,
            memory: snap.memory_total,
            version: env!("CARGO_PKG_VERSION").to_string(),
            region: cfg.region.clone(),
            labels: cfg.labels.clone(),
            max_concurrency: cfg.max_concurrency,
        }
    }

    /// Current status, as served by `GetStatus` and sent with heartbeats.
    pub fn status(&self) -> proto::SlaveStatus {
        let (ids, workers, active_requests) = {
            let running = self.running();
            let mut ids: Vec<String> = running.keys().cloned().collect();
            ids.sort();
            let workers: i64 = running.values().map(|t| i64::from(t.workers)).sum();
            let requests: u64 = running
                .values()
                .map(|t| t.requests.load(Ordering::Relaxed))
                .sum();
            (ids, workers, requests)
        };

        let state = if self.shared.shutdown.is_cancelled() {
            SlaveState::Stopping
        } else if ids.is_empty() {
            SlaveState::Idle
        } else {
            SlaveState::Running
        };
        let snap = SystemSnapshot::capture();

        proto::SlaveStatus {
            slave_id: self.shared.slave_id.to_string(),
            state: proto::SlaveState::from(state) as i32,
            current_task_id: ids.first().cloned().unwrap_or_default(),
            cpu_usage: snap.cpu_percent,
            memory_usage: snap.memory_percent,
            running_workers: workers,
            total_requests: self.shared.finished_requests.load(Ordering::Relaxed)
                + active_requests,
            timestamp: time_serde::to_unix(SystemTime::now()),
            running_task_ids: ids,
            memory_used: snap.memory_used,
            memory_total: snap.memory_total,
            load_average: snap.load_average,
        }
    }

    fn execute(&self, req: ExecuteRequest) -> proto::TaskResponse {
        let task_id = req.task_id.clone();
        let reject = |message: String| {
            debug!(%task_id, %message, "task rejected");
            proto::TaskResponse {
                accepted: false,
                message,
                task_id: task_id.clone(),
            }
        };

        if self.shared.shutdown.is_cancelled() {
            return reject("slave is shutting down".into());
        }

        let mut running = self.running();
        if running.contains_key(&req.task_id) {
            return reject(format!("task {task_id} is already running on this slave"));
        }
        let max = self.shared.config.max_concurrency as usize;
        if running.len() >= max {
            let current = running.keys().next().cloned().unwrap_or_default();
            return reject(if max == 1 {
                format!("slave is already executing task {current}")
            } else {
                format!("slave is at capacity ({}/{max} tasks)", running.len())
            });
        }

        let cancel = self.shared.shutdown.child_token();
        let requests = Arc::new(AtomicU64::new(0));
        let sink = StatsSink::new(
            Arc::clone(&self.shared.slave_id),
            &task_id,
            self.shared.stats_tx.clone(),
            Arc::clone(&self.shared.dropped),
            Arc::clone(&requests),
        );
        let sub_task_id = req.sub_task_id.clone();
        let workers = req.worker_count;

        let agent = self.clone();
        let handle = tokio::spawn(agent.drive(req, sink, cancel.clone()));
        running.insert(
            task_id.clone(),
            RunningTask {
                sub_task_id,
                workers,
                cancel,
                abort: handle.abort_handle(),
                requests,
                stop_requested: false,
            },
        );
        info!(%task_id, workers, "task accepted");

        proto::TaskResponse {
            accepted: true,
            message: "task accepted".into(),
            task_id,
        }
    }

    async fn drive(self, req: ExecuteRequest, sink: StatsSink, cancel: CancellationToken) {
        let task_id = req.task_id.clone();
        let result = self.shared.engine.run(req, sink, cancel).await;

        let Some(entry) = self.running().remove(&task_id) else {
            return;
        };
        self.shared
            .finished_requests
            .fetch_add(entry.requests.load(Ordering::Relaxed), Ordering::Relaxed);
        if entry.stop_requested {
            info!(%task_id, sub_task_id = %entry.sub_task_id, "task stopped");
            return;
        }

        let (success, error_message) = match result {
            Ok(()) if self.shared.shutdown.is_cancelled() => {
                (false, "slave shut down before the task finished".to_string())
            }
            Ok(()) => (true, String::new()),
            Err(e) => (false, e.to_string()),
        };
        if success {
            info!(%task_id, "task finished");
        } else {
            warn!(%task_id, error = %error_message, "task failed");
        }

        let report = CompletionReport {
            slave_id: self.shared.slave_id.to_string(),
            task_id,
            success,
            error_message,
            completed_at: SystemTime::now(),
        };
        if self.shared.completions_tx.send(report).await.is_err() {
            debug!("completion channel closed");
        }
    }

    fn stop(&self, task_id: &str, force: bool) -> proto::StopResponse {
        let mut running = self.running();
        let Some(task) = running.get_mut(task_id) else {
            return proto::StopResponse {
                stopped: false,
                message: format!("task {task_id} is not running"),
            };
        };

        task.stop_requested = true;
        task.cancel.cancel();
        if force {
            task.abort.abort();
            if let Some(task) = running.remove(task_id) {
                self.shared
                    .finished_requests
                    .fetch_add(task.requests.load(Ordering::Relaxed), Ordering::Relaxed);
            }
            info!(%task_id, "task aborted");
        } else {
            info!(%task_id, "stop requested");
        }

        proto::StopResponse {
            stopped: true,
            message: if force { "task aborted" } else { "stop requested" }.into(),
        }
    }
}

#[tonic::async_trait]
impl SlaveService for SlaveAgent {
    async fn execute_task(
        &self,
        request: Request<proto::TaskConfig>,
    ) -> Result<Response<proto::TaskResponse>, Status> {
        let req = ExecuteRequest::from(request.into_inner());
        if req.task_id.trim().is_empty() {
            return Err(Status::invalid_argument("task_id cannot be empty"));
        }
        if req.worker_count == 0 {
            return Err(Status::invalid_argument("worker_count must be positive"));
        }
        Ok(Response::new(self.execute(req)))
    }

    async fn stop_task(
        &self,
        request: Request<proto::StopRequest>,
    ) -> Result<Response<proto::StopResponse>, Status> {
        let req = request.into_inner();
        Ok(Response::new(self.stop(&req.task_id, req.force)))
    }

    async fn get_status(
        &self,
        _request: Request<proto::StatusRequest>,
    ) -> Result<Response<proto::SlaveStatus>, Status> {
        Ok(Response::new(self.status()))
    }

    async fn update_config(
        &self,
        request: Request<proto::ConfigUpdate>,
    ) -> Result<Response<proto::UpdateResponse>, Status> {
        let req = request.into_inner();
        if !req.slave_id.is_empty() && req.slave_id != *self.shared.slave_id {
            return Ok(Response::new(proto::UpdateResponse {
                success: false,
                message: format!("update addressed to {}", req.slave_id),
            }));
        }

        let mut keys: Vec<&String> = req.config.keys().collect();
        keys.sort();
        info!(?keys, "config updated");

        self.shared
            .overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(req.config);
        Ok(Response::new(proto::UpdateResponse {
            success: true,
            message: "config updated".into(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    enum Script {
        Succeed,
        Fail,
        UntilCancelled,
    }

    struct ScriptedEngine(Script);

    #[async_trait]
    impl LoadEngine for ScriptedEngine {
        async fn run(
            &self,
            _task: ExecuteRequest,
            stats: StatsSink,
            cancel: CancellationToken,
        ) -> Result<(), AgentError> {
            stats.report(SlaveStats {
                total_requests: 7,
                success_requests: 7,
                ..Default::default()
            });
            match self.0 {
                Script::Succeed => Ok(()),
                Script::Fail => Err(AgentError::Engine("target refused".into())),
                Script::UntilCancelled => {
                    cancel.cancelled().await;
                    Ok(())
                }
            }
        }
    }

    fn agent(script: Script, max_concurrency: u32) -> (SlaveAgent, AgentOutbox) {
        let config = AgentConfig {
            slave_id: "s1".into(),
            max_concurrency,
            ..Default::default()
        };
        SlaveAgent::new(config, Arc::new(ScriptedEngine(script))).unwrap()
    }

    fn config(task_id: &str) -> proto::TaskConfig {
        proto::TaskConfig {
            task_id: task_id.into(),
            sub_task_id: format!("{task_id}-s1"),
            worker_count: 4,
            target: "http://svc".into(),
            ..Default::default()
        }
    }

    async fn execute(agent: &SlaveAgent, task_id: &str) -> proto::TaskResponse {
        agent
            .execute_task(Request::new(config(task_id)))
            .await
            .unwrap()
            .into_inner()
    }

    async fn wait_idle(agent: &SlaveAgent) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !agent.running_tasks().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn finished_task_reports_success_and_stats() {
        let (agent, mut outbox) = agent(Script::Succeed, 1);

        let reply = execute(&agent, "t1").await;
        assert!(reply.accepted);
        assert_eq!(reply.task_id, "t1");

        let report = tokio::time::timeout(Duration::from_secs(2), outbox.completions.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(report.success);
        assert_eq!(report.slave_id, "s1");
        assert_eq!(report.task_id, "t1");

        let sample = outbox.stats.recv().await.unwrap();
        assert_eq!(sample.task_id, "t1");
        assert_eq!(sample.total_requests, 7);

        wait_idle(&agent).await;
        assert_eq!(agent.status().total_requests, 7);
    }

    #[tokio::test]
    async fn engine_error_reports_failure() {
        let (agent, mut outbox) = agent(Script::Fail, 1);
        assert!(execute(&agent, "t1").await.accepted);

        let report = tokio::time::timeout(Duration::from_secs(2), outbox.completions.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!report.success);
        assert!(report.error_message.contains("target refused"));
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let (agent, _outbox) = agent(Script::UntilCancelled, 1);
        assert!(execute(&agent, "t1").await.accepted);

        let busy = execute(&agent, "t2").await;
        assert!(!busy.accepted);
        assert!(busy.message.contains("already executing task t1"));

        let dup = execute(&agent, "t1").await;
        assert!(!dup.accepted);

        let (wide, _outbox) = self::agent(Script::UntilCancelled, 2);
        assert!(execute(&wide, "a").await.accepted);
        assert!(execute(&wide, "b").await.accepted);
        let full = execute(&wide, "c").await;
        assert!(full.message.contains("capacity (2/2"));
        assert_eq!(wide.running_tasks(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn stopped_task_sends_no_completion() {
        let (agent, mut outbox) = agent(Script::UntilCancelled, 1);
        assert!(execute(&agent, "t1").await.accepted);

        let status = agent.status();
        assert_eq!(status.state, proto::SlaveState::Running as i32);
        assert_eq!(status.running_workers, 4);
        assert_eq!(status.current_task_id, "t1");

        let reply = agent
            .stop_task(Request::new(proto::StopRequest {
                task_id: "t1".into(),
                force: false,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(reply.stopped);

        wait_idle(&agent).await;
        assert!(outbox.completions.try_recv().is_err());
        assert_eq!(agent.status().state, proto::SlaveState::Idle as i32);
        assert!(execute(&agent, "t2").await.accepted);
    }

    #[tokio::test]
    async fn force_stop_frees_slot_immediately() {
        let (agent, _outbox) = agent(Script::UntilCancelled, 1);
        assert!(execute(&agent, "t1").await.accepted);

        let reply = agent.stop("t1", true);
        assert!(reply.stopped);
        assert!(agent.running_tasks().is_empty());

        let unknown = agent.stop("nope", false);
        assert!(!unknown.stopped);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let (agent, mut outbox) = agent(Script::UntilCancelled, 1);
        assert!(execute(&agent, "t1").await.accepted);

        agent.shutdown();
        let report = tokio::time::timeout(Duration::from_secs(2), outbox.completions.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!report.success);
        assert_eq!(agent.status().state, proto::SlaveState::Stopping as i32);
        assert!(!execute(&agent, "t2").await.accepted);
    }

    #[tokio::test]
    async fn invalid_requests_and_config_updates() {
        let (agent, _outbox) = agent(Script::Succeed, 1);

        let err = agent
            .execute_task(Request::new(proto::TaskConfig::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let reply = agent
            .update_config(Request::new(proto::ConfigUpdate {
                slave_id: "s1".into(),
                config: HashMap::from([("rate".to_string(), "100".to_string())]),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(reply.success);
        assert_eq!(agent.config_overrides().get("rate").map(String::as_str), Some("100"));

        let other = agent
            .update_config(Request::new(proto::ConfigUpdate {
                slave_id: "s2".into(),
                config: HashMap::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!other.success);
    }

    #[test]
    fn info_advertises_config() {
        let config = AgentConfig {
            slave_id: "s9".into(),
            advertise_host: "10.1.1.1".into(),
            advertise_port: 7000,
            region: "eu".into(),
            max_concurrency: 3,
            ..Default::default()
        };
        let (agent, _outbox) = SlaveAgent::new(config, Arc::new(ScriptedEngine(Script::Succeed))).unwrap();
        let info = agent.info();
        assert_eq!(info.slave_id, "s9");
        assert_eq!(info.ip, "10.1.1.1");
        assert_eq!(info.grpc_port, 7000);
        assert_eq!(info.region, "eu");
        assert_eq!(info.max_concurrency, 3);
    }
}
