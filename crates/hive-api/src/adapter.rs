use std::sync::Arc;

use async_trait::async_trait;
use hive_core::{CoreError, Master};
use hive_model::{
    AggregatedStats, SlaveInfo, SlaveStats, Task, TaskConfig, TaskPage, TaskQuery,
    TaskStartOptions,
};

use crate::error::ApiError;
use crate::handler::{ApiHandler, LiveStatsView, StatusView};

/// [`ApiHandler`] backed directly by a [`Master`].
pub struct MasterApiAdapter {
    master: Arc<Master>,
}

impl MasterApiAdapter {
    pub fn new(master: Arc<Master>) -> Self {
        Self { master }
    }

    fn task(&self, id: &str) -> Result<Task, ApiError> {
        self.master
            .queue()
            .get(id)
            .ok_or_else(|| CoreError::TaskNotFound(id.to_string()).into())
    }
}

fn validate(config: &TaskConfig) -> Result<(), ApiError> {
    if config.target.trim().is_empty() {
        return Err(ApiError::InvalidRequest("target cannot be empty".into()));
    }
    if config.worker_count == 0 {
        return Err(ApiError::InvalidRequest("worker_count must be positive".into()));
    }
    Ok(())
}

#[async_trait]
impl ApiHandler for MasterApiAdapter {
    async fn list_tasks(&self, query: TaskQuery) -> Result<TaskPage<Task>, ApiError> {
        Ok(self.master.queue().query(&query))
    }

    async fn create_task(&self, config: TaskConfig, auto_start: bool) -> Result<Task, ApiError> {
        validate(&config)?;
        let task = Task::from_config(self.master.generate_task_id(), config);
        let id = self.master.submit_task(task, auto_start).await?;
        self.task(&id)
    }

    async fn get_task(&self, id: &str) -> Result<Task, ApiError> {
        self.task(id)
    }

    async fn stop_task(&self, id: &str) -> Result<Task, ApiError> {
        self.master.stop_task(id).await?;
        self.task(id)
    }

    async fn start_task(&self, id: &str, options: TaskStartOptions) -> Result<Task, ApiError> {
        let options = (!options.is_empty()).then_some(options);
        self.master.start_task(id, options).await?;
        self.task(id)
    }

    async fn retry_task(&self, id: &str) -> Result<Task, ApiError> {
        let new_id = self.master.retry_task(id)?;
        self.task(&new_id)
    }

    async fn task_stats(&self, id: &str) -> Result<AggregatedStats, ApiError> {
        self.task(id)?;
        self.master
            .collector()
            .aggregator()
            .get_aggregation(id)
            .ok_or_else(|| ApiError::NotFound(format!("no stats reported for task {id}")))
    }

    async fn slave_task_stats(
        &self,
        task_id: &str,
        slave_id: &str,
    ) -> Result<SlaveStats, ApiError> {
        self.master
            .collector()
            .slave_stats(task_id, slave_id)
            .ok_or_else(|| ApiError::NotFound(format!("no stats from slave {slave_id} for task {task_id}")))
    }

    async fn live_stats(&self) -> Result<LiveStatsView, ApiError> {
        Ok(LiveStatsView {
            combined: self.master.combined_stats(),
            tasks: self.master.all_stats(),
        })
    }

    async fn slave_stats(&self, slave_id: &str) -> Result<SlaveStats, ApiError> {
        self.master
            .latest_slave_stats(slave_id)
            .ok_or_else(|| ApiError::NotFound(format!("no stats from slave {slave_id}")))
    }

    async fn list_slaves(&self) -> Result<Vec<SlaveInfo>, ApiError> {
        Ok(self.master.registry().get_all())
    }

    async fn get_slave(&self, id: &str) -> Result<SlaveInfo, ApiError> {
        self.master
            .registry()
            .get(id)
            .ok_or_else(|| CoreError::SlaveNotFound(id.to_string()).into())
    }

    async fn status(&self) -> Result<StatusView, ApiError> {
        let status = self.master.status();
        Ok(StatusView {
            slave_count: status.slave_count,
            healthy_slaves: status.healthy_slaves,
            tasks: status.queue,
        })
    }
}
