//! Task dispatcher.
//!
//! [`Master`] owns the registry, the queue and the stats pipeline, and drives
//! a task from `Pending` to a terminal state:
//!
//! 1. pick slaves (caller targeting or the default filter),
//! 2. split the workers across them,
//! 3. fan `ExecuteTask` out to every slave concurrently and wait for all,
//! 4. reconcile: no acceptance fails the task, partial acceptance keeps it
//!    running,
//! 5. resolve it from the slaves' completion reports.
//!
//! Dispatch errors never leave the dispatcher; they end up as a task state
//! and a `failure_reason`.

mod completion;
mod connector;

pub use connector::{ExecuteAck, ExecuteRequest, SlaveConnector};

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime},
};

use dashmap::DashMap;
use futures::future::join_all;
use hive_model::{
    AggregatedStats, META_RETRY_FROM, META_RETRY_REASON, QueueStats, ResourceUsage, SlaveFilter,
    SlaveInfo, SlaveState, SlaveStats, SubTask, Task, TaskStartOptions, TaskState,
};
use taskvisor::TaskSpec;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    CoreError, DataAggregator, DispatchOutcome, HealthChecker, MasterConfig, MetricsBackend,
    SlaveRegistry, StatsCollector, TaskQueue, TaskSplitter, jobs, selector_for, splitter_for,
};
use completion::{Completion, Recorded, Resolution};

const NO_SLAVES: &str = "no available slaves";
const ALL_FAILED: &str = "all subtasks failed";
const NO_WORKERS: &str = "task has no workers to distribute";

/// A slave's notice that its share of a task finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReport {
    pub slave_id: String,
    pub task_id: String,
    pub success: bool,
    pub error_message: String,
    pub completed_at: SystemTime,
}

/// Status carried by a heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportedStatus {
    pub state: SlaveState,
    pub usage: ResourceUsage,
}

/// Snapshot for the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterStatus {
    pub slave_count: usize,
    pub healthy_slaves: usize,
    pub queue: QueueStats,
}

/// Result of [`Master::start_all_pending`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartAllReport {
    pub started: Vec<String>,
    /// Task ID to the reason it did not start.
    pub failed: HashMap<String, String>,
}

enum Dispatched {
    Accepted,
    Rejected(String),
    Failed(String),
    TimedOut,
    Cancelled,
}

pub struct Master {
    config: MasterConfig,
    registry: Arc<SlaveRegistry>,
    health: Arc<HealthChecker>,
    queue: TaskQueue,
    collector: Arc<StatsCollector>,
    splitter: Arc<dyn TaskSplitter>,
    connector: Arc<dyn SlaveConnector>,
    metrics: Arc<dyn MetricsBackend>,
    /// Cancels the dispatch fan-out of a task being started.
    inflight: DashMap<String, CancellationToken>,
    /// Running tasks still waiting for completion reports.
    completions: DashMap<String, Completion>,
}

impl Master {
    /// Builds the engine; fails if `config` is invalid.
    pub fn new(
        config: MasterConfig,
        connector: Arc<dyn SlaveConnector>,
        metrics: Arc<dyn MetricsBackend>,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let selector = selector_for(config.select_strategy, &config.preferred_regions);
        let registry = Arc::new(SlaveRegistry::new(selector));
        let health = Arc::new(HealthChecker::new(
            Arc::clone(&registry),
            config.health_check_interval,
            config.heartbeat_timeout,
            config.max_failures,
        ));
        let collector = Arc::new(StatsCollector::new(
            config.stats_buffer_size,
            Arc::new(DataAggregator::new()),
            Arc::clone(&metrics),
        ));
        let splitter = splitter_for(config.split_strategy);

        Ok(Self {
            config,
            registry,
            health,
            queue: TaskQueue::new(),
            collector,
            splitter,
            connector,
            metrics,
            inflight: DashMap::new(),
            completions: DashMap::new(),
        })
    }

    /// Replaces the splitter chosen from the configuration.
    pub fn with_splitter(mut self, splitter: Arc<dyn TaskSplitter>) -> Self {
        self.splitter = splitter;
        self
    }

    /// Starts the health sweep, stats consumer, queue cleaner and slave
    /// gauge jobs under one supervisor. All of them stop when `token` is
    /// cancelled.
    pub fn spawn_background(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let specs = vec![
            self.health.sweep_job(token.clone()),
            self.collector.consume_job(token.clone()),
            self.cleanup_job(token.clone()),
            self.gauge_job(token.clone()),
        ];
        jobs::spawn(specs, token)
    }

    fn cleanup_job(self: &Arc<Self>, stop: CancellationToken) -> TaskSpec {
        let master = Arc::clone(self);
        let task = jobs::job("queue-cleanup", stop, move || {
            let master = Arc::clone(&master);
            async move {
                master.cleanup();
                Ok(())
            }
        });
        let every = self.config.cleanup_interval;
        jobs::periodic(task, every, jobs::backoff(every, every * 4), None)
    }

    fn gauge_job(self: &Arc<Self>, stop: CancellationToken) -> TaskSpec {
        let master = Arc::clone(self);
        let task = jobs::job("slave-gauges", stop, move || {
            let master = Arc::clone(&master);
            async move {
                master.metrics.set_slave_counts(
                    master.registry.count(),
                    master.registry.get_healthy().len(),
                );
                Ok(())
            }
        });
        let every = self.config.health_check_interval;
        jobs::periodic(task, every, jobs::backoff(every, every * 4), None)
    }

    /// Evicts finished tasks older than `cleanup_max_age` together with
    /// their stats. Returns the evicted IDs.
    pub fn cleanup(&self) -> Vec<String> {
        self.cleanup_at(SystemTime::now())
    }

    fn cleanup_at(&self, now: SystemTime) -> Vec<String> {
        let evicted = self.queue.clean_at(now, self.config.cleanup_max_age);
        self.collector.forget_tasks(&evicted);
        evicted
    }

    pub fn generate_task_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    // ---------------------------------------------------------------------
    // tasks
    // ---------------------------------------------------------------------

    /// Queues `task` and, if `auto_start`, starts it right away.
    ///
    /// A started task that fails to dispatch is still `Ok`; its state says
    /// what happened.
    ///
    /// An explicit ID may only reuse a finished task's slot.
    pub async fn submit_task(&self, mut task: Task, auto_start: bool) -> Result<String, CoreError> {
        if task.id.is_empty() {
            task.id = self.generate_task_id();
        } else if let Some(existing) = self
            .queue
            .get(&task.id)
            .filter(|t| !t.state.is_terminal())
        {
            return Err(CoreError::InvalidState {
                id: task.id,
                action: "resubmitted",
                state: existing.state,
            });
        }
        let id = self.queue.submit(task);
        self.metrics.record_task_transition(TaskState::Pending);
        info!(task_id = %id, auto_start, "task submitted");

        if auto_start {
            self.start_task(&id, None).await?;
        }
        Ok(id)
    }

    /// Starts a pending task and returns the state it ends up in after
    /// dispatch.
    #[instrument(skip(self, options), fields(task_id = %id))]
    pub async fn start_task(
        &self,
        id: &str,
        options: Option<TaskStartOptions>,
    ) -> Result<TaskState, CoreError> {
        let task = self
            .queue
            .get(id)
            .ok_or_else(|| CoreError::TaskNotFound(id.to_string()))?;
        if task.state != TaskState::Pending {
            return Err(CoreError::InvalidState {
                id: id.to_string(),
                action: "started",
                state: task.state,
            });
        }

        let slaves = self.pick_slaves(&task, options.as_ref());
        self.queue.move_to_running(id)?;
        self.metrics.record_task_transition(TaskState::Running);

        if slaves.is_empty() {
            self.fail_task(id, NO_SLAVES);
            return Ok(TaskState::Failed);
        }

        let subtasks = match self.splitter.split(&task, &slaves) {
            Ok(subtasks) if subtasks.is_empty() => {
                self.fail_task(id, NO_WORKERS);
                return Ok(TaskState::Failed);
            }
            Ok(subtasks) => subtasks,
            Err(e) => {
                self.fail_task(id, &format!("split failed: {e}"));
                return Ok(TaskState::Failed);
            }
        };
        debug!(
            slaves = slaves.len(),
            subtasks = subtasks.len(),
            splitter = self.splitter.name(),
            "task split"
        );

        let planned: Vec<String> = subtasks.iter().map(|s| s.slave_id.clone()).collect();
        self.queue.assign_slaves(id, planned)?;

        Ok(self.dispatch(&task, subtasks).await)
    }

    /// Slaves for a start: explicit IDs first, then a region, then the
    /// configured default filter.
    fn pick_slaves(&self, task: &Task, options: Option<&TaskStartOptions>) -> Vec<SlaveInfo> {
        let options = options.filter(|o| !o.is_empty());

        if let Some(opts) = options.filter(|o| !o.slave_ids.is_empty()) {
            let filter = SlaveFilter::available().with_ids(opts.slave_ids.iter().cloned());
            return self
                .registry
                .select_with_filter(opts.slave_ids.len(), &filter);
        }

        let required = self.required_slaves(task);
        match options.and_then(|o| o.slave_region.as_deref()) {
            Some(region) => {
                let filter = SlaveFilter::available().with_region(region);
                self.registry.select_with_filter(required, &filter)
            }
            None => self
                .registry
                .select_with_filter(required, &self.config.default_filter),
        }
    }

    fn required_slaves(&self, task: &Task) -> usize {
        let by_workers = (task.total_workers / self.config.workers_per_slave.max(1)) as usize;
        by_workers.max(self.config.min_slave_count).max(1)
    }

    /// Fans `ExecuteTask` out and reconciles once every call has returned.
    async fn dispatch(&self, task: &Task, subtasks: Vec<SubTask>) -> TaskState {
        let token = CancellationToken::new();
        self.inflight.insert(task.id.clone(), token.clone());
        self.completions.insert(
            task.id.clone(),
            Completion::new(subtasks.iter().map(|s| s.slave_id.clone())),
        );

        let mut calls = JoinSet::new();
        let mut unreachable = Vec::new();
        for sub in subtasks {
            let Some(slave) = self.registry.get(&sub.slave_id) else {
                unreachable.push(sub.slave_id);
                continue;
            };
            let connector = Arc::clone(&self.connector);
            let request = ExecuteRequest::new(task, &sub);
            let timeout = self.config.dispatch_timeout;
            let token = token.clone();

            calls.spawn(async move {
                let outcome = tokio::select! {
                    _ = token.cancelled() => Dispatched::Cancelled,
                    res = tokio::time::timeout(timeout, connector.execute_task(&slave, request)) => {
                        match res {
                            Ok(Ok(ack)) if ack.accepted => Dispatched::Accepted,
                            Ok(Ok(ack)) => Dispatched::Rejected(ack.message),
                            Ok(Err(e)) => Dispatched::Failed(e.to_string()),
                            Err(_) => Dispatched::TimedOut,
                        }
                    }
                };
                (slave.id, outcome)
            });
        }

        let mut accepted = Vec::new();
        let mut failed = unreachable.len();
        for slave_id in &unreachable {
            warn!(task_id = %task.id, slave_id = %slave_id, "slave left before dispatch");
            self.metrics.record_dispatch(DispatchOutcome::Failed);
        }

        while let Some(joined) = calls.join_next().await {
            let (slave_id, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "dispatch call aborted");
                    self.metrics.record_dispatch(DispatchOutcome::Failed);
                    failed += 1;
                    continue;
                }
            };

            match outcome {
                Dispatched::Accepted => {
                    self.metrics.record_dispatch(DispatchOutcome::Accepted);
                    if let Err(e) = self.registry.add_task(&slave_id, &task.id) {
                        warn!(task_id = %task.id, slave_id = %slave_id, error = %e, "accepted task not tracked");
                    }
                    debug!(task_id = %task.id, slave_id = %slave_id, "subtask accepted");
                    accepted.push(slave_id);
                }
                Dispatched::Rejected(message) => {
                    self.metrics.record_dispatch(DispatchOutcome::Rejected);
                    warn!(task_id = %task.id, slave_id = %slave_id, message = %message, "subtask rejected");
                    failed += 1;
                }
                Dispatched::Failed(err) => {
                    self.metrics.record_dispatch(DispatchOutcome::Failed);
                    warn!(task_id = %task.id, slave_id = %slave_id, error = %err, "subtask dispatch failed");
                    failed += 1;
                }
                Dispatched::TimedOut => {
                    self.metrics.record_dispatch(DispatchOutcome::TimedOut);
                    warn!(task_id = %task.id, slave_id = %slave_id, "subtask dispatch timed out");
                    failed += 1;
                }
                Dispatched::Cancelled => failed += 1,
            }
        }
        self.inflight.remove(&task.id);

        if token.is_cancelled() {
            debug!(task_id = %task.id, accepted = accepted.len(), "dispatch cancelled by stop");
            self.withdraw(&task.id, &accepted).await;
            return self.state_of(&task.id);
        }

        if accepted.is_empty() {
            self.completions.remove(&task.id);
            self.fail_task(&task.id, ALL_FAILED);
            return self.state_of(&task.id);
        }

        if failed > 0 {
            warn!(
                task_id = %task.id,
                accepted = accepted.len(),
                failed,
                "task running with partial assignment"
            );
        } else {
            info!(task_id = %task.id, slaves = accepted.len(), "task dispatched");
        }

        if let Err(e) = self.queue.assign_slaves(&task.id, accepted.clone()) {
            debug!(task_id = %task.id, error = %e, "assignment not updated");
        }

        let recorded = self
            .completions
            .get_mut(&task.id)
            .map(|mut c| c.dispatched(&accepted));
        if let Some(Recorded::Resolved(resolution)) = recorded {
            self.completions.remove(&task.id);
            self.resolve(&task.id, resolution);
        }
        self.state_of(&task.id)
    }

    /// Undoes acceptances that raced with a stop: the stop may have run
    /// before these slaves were tracked, so they get their own stop request.
    async fn withdraw(&self, task_id: &str, accepted: &[String]) {
        let stops = accepted.iter().map(|slave_id| async move {
            if let Err(e) = self.registry.remove_task(slave_id, task_id) {
                debug!(slave_id = %slave_id, error = %e, "slave gone during withdraw");
            }
            let Some(slave) = self.registry.get(slave_id) else {
                return;
            };
            let call = self.connector.stop_task(&slave, task_id, false);
            match tokio::time::timeout(self.config.stop_timeout, call).await {
                Ok(Ok(())) => debug!(slave_id = %slave.id, "late acceptance withdrawn"),
                Ok(Err(e)) => warn!(slave_id = %slave.id, error = %e, "withdraw request failed"),
                Err(_) => warn!(slave_id = %slave.id, "withdraw request timed out"),
            }
        });
        join_all(stops).await;
    }

    fn state_of(&self, id: &str) -> TaskState {
        self.queue
            .get(id)
            .map(|t| t.state)
            .unwrap_or(TaskState::Stopped)
    }

    fn fail_task(&self, id: &str, reason: &str) {
        match self.queue.move_to_failed(id, reason) {
            Ok(()) => {
                self.metrics.record_task_transition(TaskState::Failed);
                warn!(task_id = %id, reason, "task failed");
            }
            Err(e) => debug!(task_id = %id, error = %e, "task not moved to failed"),
        }
    }

    fn resolve(&self, id: &str, resolution: Resolution) {
        match resolution {
            Resolution::Completed => match self.queue.move_to_complete(id) {
                Ok(()) => {
                    self.metrics.record_task_transition(TaskState::Completed);
                    info!(task_id = %id, "task completed");
                }
                Err(e) => debug!(task_id = %id, error = %e, "task not moved to completed"),
            },
            Resolution::Failed(reason) => self.fail_task(id, &reason),
        }
    }

    /// Stops a task: cancels an in-flight dispatch, asks every assigned
    /// slave to stop (best effort) and cancels the task in the queue.
    #[instrument(skip(self), fields(task_id = %id))]
    pub async fn stop_task(&self, id: &str) -> Result<(), CoreError> {
        let task = self
            .queue
            .get(id)
            .ok_or_else(|| CoreError::TaskNotFound(id.to_string()))?;

        if let Some((_, token)) = self.inflight.remove(id) {
            token.cancel();
        }
        self.completions.remove(id);

        let stops = task
            .assigned_slaves
            .iter()
            .filter_map(|slave_id| self.registry.get(slave_id))
            .map(|slave| async move {
                let call = self.connector.stop_task(&slave, id, false);
                match tokio::time::timeout(self.config.stop_timeout, call).await {
                    Ok(Ok(())) => debug!(slave_id = %slave.id, "slave stopped task"),
                    Ok(Err(e)) => warn!(slave_id = %slave.id, error = %e, "stop request failed"),
                    Err(_) => warn!(slave_id = %slave.id, "stop request timed out"),
                }
                if let Err(e) = self.registry.remove_task(&slave.id, id) {
                    debug!(slave_id = %slave.id, error = %e, "slave gone during stop");
                }
            });
        join_all(stops).await;

        self.queue.cancel(id)?;
        self.metrics.record_task_transition(TaskState::Stopped);
        info!(task_id = %id, "task stopped");
        Ok(())
    }

    /// Queues a copy of a finished task and returns the new ID.
    pub fn retry_task(&self, id: &str) -> Result<String, CoreError> {
        let old = self
            .queue
            .get(id)
            .ok_or_else(|| CoreError::TaskNotFound(id.to_string()))?;
        if !old.state.is_terminal() {
            return Err(CoreError::InvalidState {
                id: id.to_string(),
                action: "retried",
                state: old.state,
            });
        }

        let mut config = old.to_config();
        config
            .metadata
            .insert(META_RETRY_FROM.to_string(), old.id.clone());
        config
            .metadata
            .insert(META_RETRY_REASON.to_string(), old.state.to_string());

        let new_id = self
            .queue
            .submit(Task::from_config(self.generate_task_id(), config));
        self.metrics.record_task_transition(TaskState::Pending);
        info!(task_id = %new_id, retry_from = %id, "task resubmitted");
        Ok(new_id)
    }

    /// Starts every pending task in submission order.
    pub async fn start_all_pending(&self) -> StartAllReport {
        let mut report = StartAllReport::default();
        for task in self.queue.get_pending() {
            match self.start_task(&task.id, None).await {
                Ok(TaskState::Failed) => {
                    let reason = self
                        .queue
                        .get(&task.id)
                        .and_then(|t| t.failure_reason().map(str::to_string))
                        .unwrap_or_default();
                    report.failed.insert(task.id, reason);
                }
                Ok(_) => report.started.push(task.id),
                Err(e) => {
                    report.failed.insert(task.id, e.to_string());
                }
            }
        }
        report
    }

    /// Applies a slave's completion report and returns the task's state.
    pub fn report_completion(&self, report: CompletionReport) -> Result<TaskState, CoreError> {
        let task = self
            .queue
            .get(&report.task_id)
            .ok_or_else(|| CoreError::TaskNotFound(report.task_id.clone()))?;
        if self.registry.get(&report.slave_id).is_none() {
            return Err(CoreError::SlaveNotFound(report.slave_id));
        }

        if let Err(e) = self.registry.remove_task(&report.slave_id, &task.id) {
            debug!(slave_id = %report.slave_id, error = %e, "completion from vanished slave");
        }

        let recorded = match self.completions.get_mut(&task.id) {
            Some(mut c) => c.record(&report.slave_id, report.success, &report.error_message),
            None => Recorded::Duplicate,
        };
        match recorded {
            Recorded::Resolved(resolution) => {
                self.completions.remove(&task.id);
                self.resolve(&task.id, resolution);
            }
            Recorded::Waiting { remaining } => debug!(
                task_id = %task.id,
                slave_id = %report.slave_id,
                success = report.success,
                remaining,
                "subtask finished"
            ),
            Recorded::Duplicate => debug!(
                task_id = %task.id,
                slave_id = %report.slave_id,
                "completion report ignored"
            ),
        }
        Ok(self.state_of(&task.id))
    }

    // ---------------------------------------------------------------------
    // slaves
    // ---------------------------------------------------------------------

    pub fn register_slave(&self, info: SlaveInfo) -> Result<(), CoreError> {
        self.registry.register(info)
    }

    /// Removes a slave. Its unfinished sub-tasks count as failed.
    pub fn unregister_slave(&self, id: &str, reason: &str) -> Result<(), CoreError> {
        let info = self.registry.unregister(id)?;
        self.health.forget(id);
        self.connector.forget(id);
        self.collector.forget_slave(id);
        info!(slave_id = %id, reason, "slave left");

        let message = format!("slave unregistered: {reason}");
        for task_id in &info.running_tasks {
            let recorded = self
                .completions
                .get_mut(task_id)
                .map(|mut c| c.record(id, false, &message));
            if let Some(Recorded::Resolved(resolution)) = recorded {
                self.completions.remove(task_id);
                self.resolve(task_id, resolution);
            }
        }
        Ok(())
    }

    /// Refreshes liveness and applies the reported status, if any.
    pub fn heartbeat(&self, id: &str, status: Option<ReportedStatus>) -> Result<(), CoreError> {
        self.health.record_heartbeat(id)?;
        if let Some(status) = status {
            self.registry
                .apply_reported_status(id, status.state, status.usage)?;
        }
        Ok(())
    }

    /// Hands a sample to the collector; `false` if it was dropped.
    pub fn collect_stats(&self, stats: SlaveStats) -> bool {
        self.collector.collect(stats)
    }

    /// Rollup of every task with stats, keyed by task ID.
    pub fn all_stats(&self) -> HashMap<String, AggregatedStats> {
        self.collector.aggregator().get_all_aggregations()
    }

    /// One rollup across every task; `None` before the first sample.
    pub fn combined_stats(&self) -> Option<AggregatedStats> {
        self.collector.aggregator().combined()
    }

    /// Latest sample a slave reported, for whichever task it ran.
    pub fn latest_slave_stats(&self, slave_id: &str) -> Option<SlaveStats> {
        self.collector.latest(slave_id)
    }

    pub fn status(&self) -> MasterStatus {
        MasterStatus {
            slave_count: self.registry.count(),
            healthy_slaves: self.registry.get_healthy().len(),
            queue: self.queue.stats(),
        }
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SlaveRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn collector(&self) -> &Arc<StatsCollector> {
        &self.collector
    }

    /// Heartbeat interval advertised to slaves at registration.
    pub fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval
    }
}
