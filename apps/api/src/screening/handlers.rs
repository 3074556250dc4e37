use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::screening::{
    NodeKind, NodeRunStatus, RunMetric, ScreeningResult, ScreeningStatus, ScreeningTask,
};
use crate::screening::service::{CreateTaskRequest, ResumeProgress, TaskProgress};
use crate::screening::store::TaskFilter;
use crate::state::AppState;

#[derive(Serialize)]
pub struct TaskAck {
    pub task_id: Uuid,
    pub status: ScreeningStatus,
}

/// POST /api/v1/screening/tasks
pub async fn handle_create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskAck>), AppError> {
    let task_id = state.screening.create(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(TaskAck {
            task_id,
            status: ScreeningStatus::Pending,
        }),
    ))
}

/// GET /api/v1/screening/tasks
pub async fn handle_list_tasks(
    State(state): State<AppState>,
    Query(filter): Query<TaskFilter>,
) -> Result<Json<Vec<ScreeningTask>>, AppError> {
    Ok(Json(state.screening.list_tasks(&filter).await?))
}

/// GET /api/v1/screening/tasks/:id
pub async fn handle_get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScreeningTask>, AppError> {
    Ok(Json(state.screening.get_task(id).await?))
}

/// DELETE /api/v1/screening/tasks/:id
pub async fn handle_delete_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.screening.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/screening/tasks/:id/start
/// Returns as soon as the run is launched; poll progress for the outcome.
pub async fn handle_start_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<TaskAck>), AppError> {
    state.screening.start(id).await?;
    let task = state.screening.get_task(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(TaskAck {
            task_id: id,
            status: task.status,
        }),
    ))
}

/// POST /api/v1/screening/tasks/:id/cancel
pub async fn handle_cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskAck>, AppError> {
    state.screening.cancel(id).await?;
    Ok(Json(TaskAck {
        task_id: id,
        status: ScreeningStatus::Cancelled,
    }))
}

/// GET /api/v1/screening/tasks/:id/progress
pub async fn handle_task_progress(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskProgress>, AppError> {
    Ok(Json(state.screening.task_progress(id).await?))
}

/// GET /api/v1/screening/tasks/:id/resumes
pub async fn handle_resume_progress(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ResumeProgress>>, AppError> {
    Ok(Json(state.screening.resume_progress(id).await?))
}

/// GET /api/v1/screening/tasks/:id/resumes/:resume_id/nodes
pub async fn handle_node_status(
    State(state): State<AppState>,
    Path((id, resume_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<BTreeMap<NodeKind, Option<NodeRunStatus>>>, AppError> {
    Ok(Json(state.screening.node_run_status(id, resume_id).await?))
}

/// GET /api/v1/screening/tasks/:id/results
pub async fn handle_list_results(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ScreeningResult>>, AppError> {
    Ok(Json(state.screening.list_results(id).await?))
}

/// GET /api/v1/screening/tasks/:id/metrics
pub async fn handle_task_metrics(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunMetric>, AppError> {
    Ok(Json(state.screening.get_metrics(id).await?))
}

/// GET /api/v1/screening/results/:id
pub async fn handle_get_result(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScreeningResult>, AppError> {
    Ok(Json(state.screening.get_result(id).await?))
}
