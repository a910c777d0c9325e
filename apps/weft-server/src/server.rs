//! HTTP control API

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use weft_core::{Payload, ServerConfig, TaskState, WorkflowFilter, WorkflowState, WorkflowStatus};
use weft_workflow::{ScheduleRecord, StartRequest};

use crate::app::AppState;
use crate::error::{ApiError, ApiResult};

pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub async fn run(self) -> Result<()> {
        let addr = self.config.address();
        let app = router(self.state);

        let listener = tokio::net::TcpListener::bind(addr.as_str())
            .await
            .with_context(|| format!("Failed to bind HTTP server to {}", addr))?;
        info!("HTTP server listening on {}", addr);

        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("HTTP server error")?;

        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

pub fn router(state: AppState) -> Router {
    let api_v1 = Router::new()
        .route("/workflows", get(list_workflows))
        .route("/workflows/:id/executions", post(start_execution))
        .route("/executions", get(list_executions))
        .route("/executions/:id", get(get_execution))
        .route("/executions/:id/tasks", get(list_tasks))
        .route("/executions/:id/pause", post(pause_execution))
        .route("/executions/:id/resume", post(resume_execution))
        .route("/executions/:id/cancel", post(cancel_execution))
        .route("/signals/:key", post(send_signal))
        .route("/schedules", get(list_schedules))
        .route("/schedules/:id/enable", post(enable_schedule))
        .route("/schedules/:id/disable", post(disable_schedule));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// Route handlers

async fn health_check() -> Json<Value> {
    Json(json!({
        "service": "weft",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "ok"
    }))
}

async fn list_workflows(State(state): State<AppState>) -> Json<Value> {
    let workflows: Vec<Value> = state
        .engine
        .workflows()
        .iter()
        .map(|w| {
            json!({
                "id": w.id,
                "description": w.description,
                "tasks": w.tasks.len(),
                "scheduled": w.schedule.is_some(),
            })
        })
        .collect();
    Json(json!({ "workflows": workflows }))
}

#[derive(Debug, Default, Deserialize)]
struct StartBody {
    #[serde(default)]
    input: Payload,
    #[serde(default)]
    exec_id: Option<String>,
    #[serde(default)]
    initial_task_id: Option<String>,
}

async fn start_execution(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    body: Option<Json<StartBody>>,
) -> ApiResult<impl IntoResponse> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let mut request = StartRequest::new(workflow_id, body.input);
    if let Some(exec_id) = body.exec_id {
        request = request.with_exec_id(exec_id);
    }
    if let Some(task_id) = body.initial_task_id {
        request = request.with_initial_task(task_id);
    }

    let exec_id = state.engine.start_with(request).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "workflow_exec_id": exec_id }))))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    workflow_id: Option<String>,
    status: Option<String>,
}

async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<WorkflowState>>> {
    let mut filter = WorkflowFilter::new();
    if let Some(workflow_id) = query.workflow_id {
        filter = filter.with_workflow(workflow_id);
    }
    if let Some(statuses) = query.status {
        for raw in statuses.split(',').filter(|s| !s.is_empty()) {
            let status = WorkflowStatus::from_str(raw)
                .map_err(|_| ApiError::BadRequest(format!("unknown status {}", raw)))?;
            filter = filter.with_status(status);
        }
    }
    Ok(Json(state.engine.list_executions(&filter).await?))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(exec_id): Path<String>,
) -> ApiResult<Json<WorkflowState>> {
    Ok(Json(state.engine.get_execution(&exec_id).await?))
}

async fn list_tasks(
    State(state): State<AppState>,
    Path(exec_id): Path<String>,
) -> ApiResult<Json<Vec<TaskState>>> {
    Ok(Json(state.engine.list_tasks(&exec_id).await?))
}

async fn pause_execution(
    State(state): State<AppState>,
    Path(exec_id): Path<String>,
) -> ApiResult<Json<WorkflowState>> {
    Ok(Json(state.engine.pause(&exec_id).await?))
}

async fn resume_execution(
    State(state): State<AppState>,
    Path(exec_id): Path<String>,
) -> ApiResult<Json<WorkflowState>> {
    Ok(Json(state.engine.resume(&exec_id).await?))
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(exec_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let current = state.engine.cancel(&exec_id).await?;
    Ok((StatusCode::ACCEPTED, Json(current)))
}

async fn send_signal(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Option<Json<Payload>>,
) -> ApiResult<Json<Value>> {
    let payload = body.map(|Json(p)| p).unwrap_or_default();
    let signal = state.engine.send_signal(&key, payload.clone())?;
    let started = state.triggers.process_signal(&key, &payload).await?;
    Ok(Json(json!({
        "signal_id": signal.id,
        "triggered": started,
    })))
}

async fn list_schedules(State(state): State<AppState>) -> ApiResult<Json<Vec<ScheduleRecord>>> {
    Ok(Json(state.scheduler.list().await?))
}

async fn enable_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.scheduler.enable(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn disable_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.scheduler.disable(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
