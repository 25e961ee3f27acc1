use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::{Duration, SystemTime},
};

use hive_model::{META_FAILURE_REASON, QueueStats, Task, TaskPage, TaskQuery, TaskState};
use tracing::{debug, info};

use crate::CoreError;

/// In-memory task state machine.
///
/// One lock guards the ordered pending list, the running set, the three
/// terminal maps and the task index, so a transition moves a task between
/// them atomically.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<RwLock<QueueInner>>,
}

#[derive(Default)]
struct QueueInner {
    /// Every known task, by ID.
    tasks: HashMap<String, Task>,
    /// Pending IDs in submission order.
    pending: Vec<String>,
    /// Position of each pending ID in `pending`.
    pending_index: HashMap<String, usize>,
    running: HashSet<String>,
    /// Terminal maps record when the task got there.
    completed: HashMap<String, SystemTime>,
    failed: HashMap<String, SystemTime>,
    stopped: HashMap<String, SystemTime>,
}

impl QueueInner {
    fn task(&self, id: &str) -> Result<&Task, CoreError> {
        self.tasks
            .get(id)
            .ok_or_else(|| CoreError::TaskNotFound(id.to_string()))
    }

    fn task_mut(&mut self, id: &str) -> Result<&mut Task, CoreError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| CoreError::TaskNotFound(id.to_string()))
    }

    /// Removes `id` from the pending list and re-indexes the tail.
    fn remove_pending(&mut self, id: &str) {
        let Some(pos) = self.pending_index.remove(id) else {
            return;
        };
        self.pending.remove(pos);
        for (offset, moved) in self.pending[pos..].iter().enumerate() {
            self.pending_index.insert(moved.clone(), pos + offset);
        }
    }

    /// Drops `id` from whichever collection it currently sits in.
    fn detach(&mut self, id: &str) {
        self.remove_pending(id);
        self.running.remove(id);
        self.completed.remove(id);
        self.failed.remove(id);
        self.stopped.remove(id);
    }

    /// Terminal-state precondition shared by complete/fail.
    ///
    /// `Ok(true)` means the task already sits in `target`.
    fn check_finish(&self, id: &str, target: TaskState) -> Result<bool, CoreError> {
        match self.task(id)?.state {
            s if s == target => Ok(true),
            TaskState::Completed => Err(CoreError::AlreadyCompleted(id.to_string())),
            TaskState::Failed => Err(CoreError::AlreadyFailed(id.to_string())),
            TaskState::Stopped => Err(CoreError::AlreadyStopped(id.to_string())),
            TaskState::Running => Ok(false),
            TaskState::Pending => Err(CoreError::NotInRunning(id.to_string())),
        }
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(QueueInner::default())),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, QueueInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, QueueInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `task` as pending and returns its ID.
    ///
    /// The queue does not check for duplicates: a known ID is replaced, in
    /// whatever state it was. [`Master::submit_task`](crate::Master::submit_task)
    /// refuses IDs of unfinished tasks before they get here.
    pub fn submit(&self, mut task: Task) -> String {
        if task.id.is_empty() {
            task.id = uuid::Uuid::new_v4().to_string();
        }
        task.state = TaskState::Pending;
        task.created_at = SystemTime::now();
        task.started_at = None;
        task.completed_at = None;

        let id = task.id.clone();
        let mut inner = self.write();
        inner.detach(&id);
        let pos = inner.pending.len();
        inner.pending.push(id.clone());
        inner.pending_index.insert(id.clone(), pos);
        inner.tasks.insert(id.clone(), task);

        debug!(task_id = %id, "task submitted");
        id
    }

    pub fn move_to_running(&self, id: &str) -> Result<(), CoreError> {
        let mut inner = self.write();
        if inner.task(id)?.state != TaskState::Pending {
            return Err(CoreError::NotInPending(id.to_string()));
        }

        inner.remove_pending(id);
        inner.running.insert(id.to_string());
        let task = inner.task_mut(id)?;
        task.state = TaskState::Running;
        task.started_at = Some(SystemTime::now());

        debug!(task_id = %id, "task running");
        Ok(())
    }

    /// Completes a running task. Completing twice is a no-op.
    pub fn move_to_complete(&self, id: &str) -> Result<(), CoreError> {
        let mut inner = self.write();
        if inner.check_finish(id, TaskState::Completed)? {
            return Ok(());
        }

        let now = SystemTime::now();
        inner.running.remove(id);
        inner.completed.insert(id.to_string(), now);
        let task = inner.task_mut(id)?;
        task.state = TaskState::Completed;
        task.completed_at = Some(now);

        info!(task_id = %id, "task completed");
        Ok(())
    }

    /// Fails a running task and records `reason`. Failing twice is a no-op.
    pub fn move_to_failed(&self, id: &str, reason: &str) -> Result<(), CoreError> {
        let mut inner = self.write();
        if inner.check_finish(id, TaskState::Failed)? {
            return Ok(());
        }

        let now = SystemTime::now();
        inner.running.remove(id);
        inner.failed.insert(id.to_string(), now);
        let task = inner.task_mut(id)?;
        task.state = TaskState::Failed;
        task.completed_at = Some(now);
        task.metadata
            .insert(META_FAILURE_REASON.to_string(), reason.to_string());

        info!(task_id = %id, reason, "task failed");
        Ok(())
    }

    /// Stops a pending or running task.
    pub fn cancel(&self, id: &str) -> Result<(), CoreError> {
        let mut inner = self.write();
        match inner.task(id)?.state {
            TaskState::Pending | TaskState::Running => {}
            TaskState::Completed => return Err(CoreError::AlreadyCompleted(id.to_string())),
            TaskState::Failed => return Err(CoreError::AlreadyFailed(id.to_string())),
            TaskState::Stopped => return Err(CoreError::AlreadyStopped(id.to_string())),
        }

        let now = SystemTime::now();
        inner.detach(id);
        inner.stopped.insert(id.to_string(), now);
        let task = inner.task_mut(id)?;
        task.state = TaskState::Stopped;
        task.completed_at = Some(now);

        info!(task_id = %id, "task stopped");
        Ok(())
    }

    /// Records the slaves a task was split across.
    pub fn assign_slaves(&self, id: &str, slave_ids: Vec<String>) -> Result<(), CoreError> {
        let mut inner = self.write();
        inner.task_mut(id)?.assigned_slaves = slave_ids;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.read().tasks.get(id).cloned()
    }

    /// All tasks, oldest first.
    pub fn get_all_tasks(&self) -> Vec<Task> {
        let inner = self.read();
        let mut tasks: Vec<Task> = inner.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Pending tasks in submission order.
    pub fn get_pending(&self) -> Vec<Task> {
        let inner = self.read();
        inner
            .pending
            .iter()
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect()
    }

    pub fn get_running(&self) -> Vec<Task> {
        let inner = self.read();
        let mut tasks: Vec<Task> = inner
            .running
            .iter()
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Filtered, paginated listing; `total` counts matches before pagination.
    pub fn query(&self, q: &TaskQuery) -> TaskPage<Task> {
        let filtered: Vec<Task> = self
            .get_all_tasks()
            .into_iter()
            .filter(|t| q.state.is_none_or(|s| t.state == s))
            .collect();
        let total = filtered.len();
        let items = filtered.into_iter().skip(q.offset).take(q.limit).collect();
        TaskPage { items, total }
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.read();
        QueueStats {
            pending: inner.pending.len(),
            running: inner.running.len(),
            complete: inner.completed.len(),
            failed: inner.failed.len(),
            stopped: inner.stopped.len(),
        }
    }

    /// Evicts completed and failed tasks that finished more than `max_age`
    /// ago and returns their IDs. Stopped tasks are kept for retry lineage.
    pub fn clean(&self, max_age: Duration) -> Vec<String> {
        self.clean_at(SystemTime::now(), max_age)
    }

    pub(crate) fn clean_at(&self, now: SystemTime, max_age: Duration) -> Vec<String> {
        let mut inner = self.write();
        let is_old = |at: &SystemTime| {
            now.duration_since(*at)
                .map(|age| age > max_age)
                .unwrap_or(false)
        };

        let expired: Vec<String> = inner
            .completed
            .iter()
            .chain(inner.failed.iter())
            .filter(|(_, at)| is_old(*at))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            inner.completed.remove(id);
            inner.failed.remove(id);
            inner.tasks.remove(id);
        }
        if !expired.is_empty() {
            debug!(evicted = expired.len(), "finished tasks evicted");
        }
        expired
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
