use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use scheduler_core::model::{Task, TaskPayload, TaskResult, TaskWithLatestResult};
use scheduler_core::SchedulerError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::AppState;

async fn with_latest_result(
    state: &AppState,
    task: Task,
) -> Result<TaskWithLatestResult, ApiError> {
    let latest_result = state.store.get_latest_result(task.id).await?;
    Ok(TaskWithLatestResult { task, latest_result })
}

pub async fn list_tasks(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let tasks = state.store.list_tasks().await?;
    let mut out = Vec::with_capacity(tasks.len());
    for task in tasks {
        out.push(with_latest_result(&state, task).await?);
    }
    Ok(Json(json!({ "data": out })))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.store.get_task(id).await?;
    Ok(Json(with_latest_result(&state, task).await?))
}

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TaskPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.store.create_task(payload).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn update_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<TaskPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.store.update_task(id, payload).await?;
    Ok(Json(task))
}

pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.delete_task(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn run_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.store.get_task(id).await?;
    state.engine.manual_run(&task).await?;
    Ok(Json(json!({ "queued": true })))
}

#[derive(Debug, Deserialize, Default)]
pub struct TogglePayload {
    pub is_active: Option<bool>,
}

pub async fn toggle_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    body: Option<Json<TogglePayload>>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.store.get_task(id).await?;
    let target = body
        .and_then(|Json(p)| p.is_active)
        .unwrap_or(!task.is_active);
    let updated = state
        .store
        .update_task(
            id,
            TaskPayload { is_active: Some(target), ..Default::default() },
        )
        .await?;
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<ResultsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let results: Vec<TaskResult> = state
        .store
        .fetch_results(id, query.limit.unwrap_or(50), query.offset.unwrap_or(0))
        .await?;
    Ok(Json(json!({ "data": results })))
}

pub async fn delete_all_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.delete_results(id, None).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_one_result(
    State(state): State<Arc<AppState>>,
    Path((id, result_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.delete_results(id, Some(result_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub action: BatchAction,
    pub task_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchAction {
    Delete,
    Enable,
    Disable,
    Run,
}

#[derive(Debug, Default, Serialize)]
pub struct BatchOutcome {
    pub deleted: Vec<i64>,
    pub updated: Vec<i64>,
    pub unchanged: Vec<i64>,
    pub queued: Vec<i64>,
    pub running: Vec<i64>,
    pub blocked: Vec<i64>,
    pub missing: Vec<i64>,
}

pub async fn batch_tasks(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut outcome = BatchOutcome::default();
    for id in request.task_ids {
        let task = match state.store.get_task(id).await {
            Ok(task) => task,
            Err(SchedulerError::NotFound(_)) => {
                outcome.missing.push(id);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        match request.action {
            BatchAction::Delete => {
                state.store.delete_task(id).await?;
                outcome.deleted.push(id);
            }
            BatchAction::Enable | BatchAction::Disable => {
                let target = matches!(request.action, BatchAction::Enable);
                if task.is_active == target {
                    outcome.unchanged.push(id);
                } else {
                    state
                        .store
                        .update_task(id, TaskPayload { is_active: Some(target), ..Default::default() })
                        .await?;
                    outcome.updated.push(id);
                }
            }
            BatchAction::Run => match state.engine.manual_run(&task).await {
                Ok(()) => outcome.queued.push(id),
                Err(SchedulerError::Conflict) => outcome.running.push(id),
                Err(SchedulerError::DependencyNotMet) => outcome.blocked.push(id),
                Err(e) => return Err(e.into()),
            },
        }
    }
    Ok(Json(outcome))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let task_count = state.store.list_tasks().await?.len();
    Ok(Json(json!({ "time": chrono::Utc::now(), "task_count": task_count })))
}

pub async fn accounts(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let posix_supported = cfg!(unix);
    let accounts = scheduler_core::account::list_allowed_accounts()?;
    Ok(Json(json!({
        "data": accounts,
        "meta": {
            "posix_supported": posix_supported,
            "default_account": state.default_account,
        }
    })))
}
