use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use db::models::{
    project::{CreateProject, Project},
    run::Run,
};
use serde::{Deserialize, Serialize};
use services::services::ConsistencyReport;
use uuid::Uuid;

use crate::{error::ApiError, response::ApiResponse, routes::AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/projects", get(list_projects).post(create_project))
        .route("/projects/{id}", get(get_project).delete(delete_project))
        .route("/projects/{id}/provision", post(provision_project))
        .route("/projects/{id}/teardown", post(teardown_project))
        .route("/projects/{id}/runs", get(list_runs).post(start_run))
        .route("/projects/{id}/runs/current", get(current_run))
}

async fn create_project(
    State(state): State<AppState>,
    Json(payload): Json<CreateProject>,
) -> Result<Json<ApiResponse<Project>>, ApiError> {
    let project = Project::create(&state.db.pool, &payload, Uuid::new_v4()).await?;
    Ok(Json(ApiResponse::success(project)))
}

async fn list_projects(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<Project>>>, ApiError> {
    let projects = Project::find_all(&state.db.pool).await?;
    Ok(Json(ApiResponse::success(projects)))
}

#[derive(Deserialize)]
struct GetProjectQuery {
    /// When set, the response includes a consistency report comparing the
    /// ledger against the sandbox runtime.
    #[serde(default)]
    verify: bool,
}

#[derive(Serialize)]
struct ProjectStatusResponse {
    #[serde(flatten)]
    project: Project,
    #[serde(skip_serializing_if = "Option::is_none")]
    consistency: Option<ConsistencyReport>,
}

async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<GetProjectQuery>,
) -> Result<Json<ApiResponse<ProjectStatusResponse>>, ApiError> {
    let project = Project::find_by_id(&state.db.pool, id)
        .await?
        .ok_or(services::services::CoordinatorError::ProjectNotFound)?;
    let consistency = if query.verify {
        Some(state.checker.check_project(&project).await?)
    } else {
        None
    };
    Ok(Json(ApiResponse::success(ProjectStatusResponse {
        project,
        consistency,
    })))
}

async fn delete_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    state.lifecycle.delete_project(id).await?;
    Ok(Json(ApiResponse::success(())))
}

async fn provision_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Project>>, ApiError> {
    let project = state.lifecycle.provision(id).await?;
    Ok(Json(ApiResponse::success(project)))
}

async fn teardown_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Project>>, ApiError> {
    let project = state.lifecycle.teardown(id).await?;
    Ok(Json(ApiResponse::success(project)))
}

#[derive(Deserialize)]
pub struct StartRunRequest {
    pub task: String,
    pub phase: Option<String>,
}

async fn start_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<StartRunRequest>,
) -> Result<Json<ApiResponse<Run>>, ApiError> {
    let run = state
        .coordinator
        .start_run(id, &payload.task, payload.phase)
        .await?;
    Ok(Json(ApiResponse::success(run)))
}

async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<Run>>>, ApiError> {
    let runs = state.coordinator.list_runs(id).await?;
    Ok(Json(ApiResponse::success(runs)))
}

/// The project's current run: its running run if one exists, otherwise the
/// latest attempt. `data` is null for a project that never ran.
async fn current_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Option<Run>>>, ApiError> {
    let run = state.coordinator.current_run(id).await?;
    Ok(Json(ApiResponse::success(run)))
}
