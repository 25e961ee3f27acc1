use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use hive_model::{SlaveInfo, SlaveState, Task, TaskConfig, TaskQuery, TaskStartOptions, TaskState};
use hive_prometheus::PrometheusMetrics;
use serde::{Deserialize, Serialize};

use crate::{error::ApiError, handler::ApiHandler};

/// HTTP admin API builder.
pub struct HttpApi<H> {
    handler: Arc<H>,
    metrics: Option<PrometheusMetrics>,
}

impl<H> HttpApi<H>
where
    H: ApiHandler,
{
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            metrics: None,
        }
    }

    /// Serves `metrics` at `GET /metrics`.
    pub fn with_metrics(mut self, metrics: PrometheusMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build axum router with mounted endpoints.
    ///
    /// Routes:
    /// - GET /api/v1/tasks - List tasks (`?state=&limit=&offset=`)
    /// - POST /api/v1/tasks - Create task (`?auto_start=true`)
    /// - GET /api/v1/tasks/{id} - Get task
    /// - DELETE /api/v1/tasks/{id} - Stop task
    /// - POST /api/v1/tasks/{id}/start - Start pending task
    /// - POST /api/v1/tasks/{id}/retry - Retry finished task
    /// - GET /api/v1/tasks/{id}/report - Not implemented
    /// - GET /api/v1/tasks/{id}/stats - Aggregated stats
    /// - GET /api/v1/tasks/{id}/slaves/{slave_id} - Latest stats of one slave
    /// - GET /api/v1/slaves - List slaves with state counts
    /// - GET /api/v1/slaves/{id} - Get slave
    /// - GET /api/v1/stats - Live stats of every task (`?slave_id=` for one slave)
    /// - GET /api/v1/status - Master overview
    /// - GET /metrics - Prometheus text, if mounted
    pub fn router(self) -> Router {
        let api = Router::new()
            .route("/api/v1/tasks", get(list_tasks::<H>).post(create_task::<H>))
            .route("/api/v1/tasks/{id}", get(get_task::<H>).delete(stop_task::<H>))
            .route("/api/v1/tasks/{id}/start", post(start_task::<H>))
            .route("/api/v1/tasks/{id}/retry", post(retry_task::<H>))
            .route("/api/v1/tasks/{id}/report", get(task_report::<H>))
            .route("/api/v1/tasks/{id}/stats", get(task_stats::<H>))
            .route(
                "/api/v1/tasks/{id}/slaves/{slave_id}",
                get(slave_task_stats::<H>),
            )
            .route("/api/v1/slaves", get(list_slaves::<H>))
            .route("/api/v1/slaves/{id}", get(get_slave::<H>))
            .route("/api/v1/stats", get(live_stats::<H>))
            .route("/api/v1/status", get(status::<H>))
            .with_state(self.handler);

        match self.metrics {
            Some(metrics) => api.merge(
                Router::new()
                    .route("/metrics", get(prometheus_text))
                    .with_state(metrics),
            ),
            None => api,
        }
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListTasksParams {
    state: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ListTasksResponse {
    tasks: Vec<Task>,
    total: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateTaskParams {
    auto_start: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LiveStatsParams {
    slave_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskActionResponse {
    task_id: String,
    state: TaskState,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_reason: Option<String>,
}

impl TaskActionResponse {
    fn new(task: &Task, message: impl Into<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            state: task.state,
            message: message.into(),
            failure_reason: task.failure_reason().map(str::to_string),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RetryResponse {
    original_task_id: String,
    new_task_id: String,
    state: TaskState,
    message: String,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct SlaveCounts {
    idle: usize,
    running: usize,
    offline: usize,
    error: usize,
    online: usize,
}

impl SlaveCounts {
    fn of(slaves: &[SlaveInfo]) -> Self {
        let mut counts = Self::default();
        for slave in slaves {
            match slave.state {
                SlaveState::Idle => counts.idle += 1,
                SlaveState::Running
                | SlaveState::Busy
                | SlaveState::Overloaded
                | SlaveState::Stopping => counts.running += 1,
                SlaveState::Offline | SlaveState::Unreachable => counts.offline += 1,
                SlaveState::Error => counts.error += 1,
            }
        }
        counts.online = counts.idle + counts.running;
        counts
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ListSlavesResponse {
    slaves: Vec<SlaveInfo>,
    total: usize,
    stats: SlaveCounts,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/v1/tasks
async fn list_tasks<H>(
    State(handler): State<Arc<H>>,
    Query(params): Query<ListTasksParams>,
) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    let mut query = TaskQuery::new();
    if let Some(state) = params.state.as_deref().filter(|s| !s.is_empty()) {
        let state = state
            .parse::<TaskState>()
            .map_err(|_| ApiError::InvalidRequest(format!("unknown task state {state:?}")))?;
        query = query.with_state(state);
    }
    if let Some(limit) = params.limit {
        query = query.with_limit(limit);
    }
    if let Some(offset) = params.offset {
        query = query.with_offset(offset);
    }

    let page = handler.list_tasks(query).await?;
    Ok(Json(ListTasksResponse {
        tasks: page.items,
        total: page.total,
    }))
}

/// POST /api/v1/tasks
async fn create_task<H>(
    State(handler): State<Arc<H>>,
    Query(params): Query<CreateTaskParams>,
    Json(config): Json<TaskConfig>,
) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    let task = handler.create_task(config, params.auto_start).await?;
    let message = if params.auto_start {
        "task created and started"
    } else {
        "task created"
    };
    Ok((StatusCode::CREATED, Json(TaskActionResponse::new(&task, message))))
}

/// GET /api/v1/tasks/{id}
async fn get_task<H>(
    State(handler): State<Arc<H>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    Ok(Json(handler.get_task(&id).await?))
}

/// DELETE /api/v1/tasks/{id}
async fn stop_task<H>(
    State(handler): State<Arc<H>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    let task = handler.stop_task(&id).await?;
    Ok(Json(TaskActionResponse::new(&task, "task stopped")))
}

/// POST /api/v1/tasks/{id}/start
///
/// The body is optional; an empty body starts on the default candidates.
async fn start_task<H>(
    State(handler): State<Arc<H>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    let options = if body.iter().all(u8::is_ascii_whitespace) {
        TaskStartOptions::default()
    } else {
        serde_json::from_slice::<TaskStartOptions>(&body)
            .map_err(|e| ApiError::InvalidRequest(format!("invalid start options: {e}")))?
    };

    let task = handler.start_task(&id, options).await?;
    let message = match task.state {
        TaskState::Running => "task started",
        TaskState::Failed => "task failed to start",
        _ => "task start processed",
    };
    Ok(Json(TaskActionResponse::new(&task, message)))
}

/// POST /api/v1/tasks/{id}/retry
async fn retry_task<H>(
    State(handler): State<Arc<H>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    let task = handler.retry_task(&id).await?;
    Ok(Json(RetryResponse {
        original_task_id: id,
        new_task_id: task.id,
        state: task.state,
        message: "retry task created".into(),
    }))
}

/// GET /api/v1/tasks/{id}/report
async fn task_report<H>(
    State(handler): State<Arc<H>>,
    Path(id): Path<String>,
) -> Result<Json<()>, ApiError>
where
    H: ApiHandler,
{
    handler.get_task(&id).await?;
    Err(ApiError::NotImplemented("task report"))
}

/// GET /api/v1/tasks/{id}/stats
async fn task_stats<H>(
    State(handler): State<Arc<H>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    Ok(Json(handler.task_stats(&id).await?))
}

/// GET /api/v1/tasks/{id}/slaves/{slave_id}
async fn slave_task_stats<H>(
    State(handler): State<Arc<H>>,
    Path((id, slave_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    Ok(Json(handler.slave_task_stats(&id, &slave_id).await?))
}

/// GET /api/v1/slaves
async fn list_slaves<H>(State(handler): State<Arc<H>>) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    let mut slaves = handler.list_slaves().await?;
    slaves.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(Json(ListSlavesResponse {
        total: slaves.len(),
        stats: SlaveCounts::of(&slaves),
        slaves,
    }))
}

/// GET /api/v1/slaves/{id}
async fn get_slave<H>(
    State(handler): State<Arc<H>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    Ok(Json(handler.get_slave(&id).await?))
}

/// GET /api/v1/stats
async fn live_stats<H>(
    State(handler): State<Arc<H>>,
    Query(params): Query<LiveStatsParams>,
) -> Result<Response, ApiError>
where
    H: ApiHandler,
{
    match params.slave_id.as_deref().filter(|s| !s.is_empty()) {
        Some(slave_id) => Ok(Json(handler.slave_stats(slave_id).await?).into_response()),
        None => Ok(Json(handler.live_stats().await?).into_response()),
    }
}

/// GET /api/v1/status
async fn status<H>(State(handler): State<Arc<H>>) -> Result<impl IntoResponse, ApiError>
where
    H: ApiHandler,
{
    Ok(Json(handler.status().await?))
}

/// GET /metrics
async fn prometheus_text(
    State(metrics): State<PrometheusMetrics>,
) -> Result<impl IntoResponse, ApiError> {
    let body = metrics
        .encode_text()
        .map_err(|e| ApiError::Internal(format!("encode metrics: {e}")))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MasterApiAdapter;
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use hive_core::{
        CoreError, ExecuteAck, ExecuteRequest, Master, MasterConfig, MetricsBackend, NoopMetrics,
        SlaveConnector,
    };
    use hive_model::SlaveStats;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    struct AcceptAll;

    #[async_trait]
    impl SlaveConnector for AcceptAll {
        async fn execute_task(
            &self,
            _slave: &SlaveInfo,
            _request: ExecuteRequest,
        ) -> Result<ExecuteAck, CoreError> {
            Ok(ExecuteAck {
                accepted: true,
                message: String::new(),
            })
        }

        async fn stop_task(
            &self,
            _slave: &SlaveInfo,
            _task_id: &str,
            _force: bool,
        ) -> Result<(), CoreError> {
            Ok(())
        }
    }

    fn master_with(metrics: Arc<dyn MetricsBackend>) -> Arc<Master> {
        Arc::new(Master::new(MasterConfig::default(), Arc::new(AcceptAll), metrics).unwrap())
    }

    fn app(master: &Arc<Master>) -> Router {
        HttpApi::new(Arc::new(MasterApiAdapter::new(Arc::clone(master)))).router()
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn task_body() -> Value {
        json!({ "protocol": "http", "target": "http://svc", "workerCount": 10 })
    }

    #[tokio::test]
    async fn create_then_get() {
        let master = master_with(Arc::new(NoopMetrics));
        let app = app(&master);

        let (status, body) = send(&app, "POST", "/api/v1/tasks", Some(task_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["state"], "pending");
        let id = body["task_id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, "GET", &format!("/api/v1/tasks/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], id.as_str());
        assert_eq!(body["totalWorkers"], 10);

        let (status, body) = send(&app, "GET", "/api/v1/tasks?state=pending", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
    }

    #[tokio::test]
    async fn invalid_input_is_bad_request() {
        let master = master_with(Arc::new(NoopMetrics));
        let app = app(&master);

        let (status, _) = send(&app, "GET", "/api/v1/tasks?state=bogus", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, "POST", "/api/v1/tasks", Some(json!({ "workerCount": 1 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("target"));
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let master = master_with(Arc::new(NoopMetrics));
        let app = app(&master);

        for uri in ["/api/v1/tasks/nope", "/api/v1/slaves/nope", "/api/v1/tasks/nope/report"] {
            let (status, _) = send(&app, "GET", uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        }
        let (status, _) = send(&app, "DELETE", "/api/v1/tasks/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn report_is_not_implemented() {
        let master = master_with(Arc::new(NoopMetrics));
        let app = app(&master);
        let id = master.submit_task(Task::new("", 1), false).await.unwrap();

        let (status, _) = send(&app, "GET", &format!("/api/v1/tasks/{id}/report"), None).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn start_without_slaves_fails_task_then_retry() {
        let master = master_with(Arc::new(NoopMetrics));
        let app = app(&master);
        let id = master.submit_task(Task::new("", 5), false).await.unwrap();

        let (status, body) = send(&app, "POST", &format!("/api/v1/tasks/{id}/start"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "failed");
        assert_eq!(body["failure_reason"], "no available slaves");

        let (status, _) = send(&app, "POST", &format!("/api/v1/tasks/{id}/start"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, "POST", &format!("/api/v1/tasks/{id}/retry"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["original_task_id"], id.as_str());
        assert_eq!(body["state"], "pending");
        assert_ne!(body["new_task_id"], id.as_str());
    }

    #[tokio::test]
    async fn start_targets_requested_slave() {
        let master = master_with(Arc::new(NoopMetrics));
        master
            .register_slave(SlaveInfo::new("s1").with_endpoint("10.0.0.1", 9091))
            .unwrap();
        master
            .register_slave(SlaveInfo::new("s2").with_endpoint("10.0.0.2", 9091))
            .unwrap();
        let app = app(&master);
        let id = master.submit_task(Task::new("", 5), false).await.unwrap();

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/v1/tasks/{id}/start"),
            Some(json!({ "slave_ids": ["s2"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "running");
        assert_eq!(master.queue().get(&id).unwrap().assigned_slaves, vec!["s2".to_string()]);

        let (status, body) = send(&app, "DELETE", &format!("/api/v1/tasks/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "stopped");
    }

    #[tokio::test]
    async fn slaves_and_status() {
        let master = master_with(Arc::new(NoopMetrics));
        master.register_slave(SlaveInfo::new("s1")).unwrap();
        master.register_slave(SlaveInfo::new("s2")).unwrap();
        master
            .registry()
            .update_slave_state("s2", SlaveState::Offline)
            .unwrap();
        let app = app(&master);

        let (status, body) = send(&app, "GET", "/api/v1/slaves", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["stats"]["idle"], 1);
        assert_eq!(body["stats"]["offline"], 1);
        assert_eq!(body["stats"]["online"], 1);

        let (status, body) = send(&app, "GET", "/api/v1/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["slave_count"], 2);
        assert_eq!(body["tasks"]["pending"], 0);
    }

    #[tokio::test]
    async fn live_stats_all_tasks_and_one_slave() {
        let master = master_with(Arc::new(NoopMetrics));
        let app = app(&master);

        let (status, body) = send(&app, "GET", "/api/v1/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["combined"].is_null());

        for (task, slave, total) in [("t1", "s1", 10u64), ("t2", "s2", 30)] {
            master.collector().ingest(SlaveStats {
                task_id: task.into(),
                slave_id: slave.into(),
                total_requests: total,
                success_requests: total,
                ..Default::default()
            });
        }

        let (status, body) = send(&app, "GET", "/api/v1/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["combined"]["totalRequests"], 40);
        assert_eq!(body["tasks"]["t2"]["totalRequests"], 30);

        let (status, body) = send(&app, "GET", "/api/v1/stats?slave_id=s1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["taskId"], "t1");

        let (status, body) = send(&app, "GET", "/api/v1/stats?slave_id=ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn metrics_endpoint_only_when_mounted() {
        let metrics = PrometheusMetrics::new().unwrap();
        let master = master_with(Arc::new(metrics.clone()));
        master.submit_task(Task::new("", 1), false).await.unwrap();

        let plain = app(&master);
        let (status, _) = send(&plain, "GET", "/metrics", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let with_metrics = HttpApi::new(Arc::new(MasterApiAdapter::new(Arc::clone(&master))))
            .with_metrics(metrics)
            .router();
        let resp = with_metrics
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(text.to_vec()).unwrap();
        assert!(text.contains("hive_task_transitions_total"));
    }

    #[test]
    fn slave_counts_group_states() {
        let mut busy = SlaveInfo::new("b");
        busy.state = SlaveState::Busy;
        let mut errored = SlaveInfo::new("e");
        errored.state = SlaveState::Error;
        let counts = SlaveCounts::of(&[SlaveInfo::new("i"), busy, errored]);
        assert_eq!(
            counts,
            SlaveCounts {
                idle: 1,
                running: 1,
                offline: 0,
                error: 1,
                online: 2,
            }
        );
    }
}
