use std::convert::Infallible;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use db::models::{project::Project, run::Run};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use services::services::{ConsistencyReport, CoordinatorError};
use uuid::Uuid;

use crate::{error::ApiError, response::ApiResponse, routes::AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/stop", post(stop_run))
        .route("/runs/{id}/resume", post(resume_run))
        .route("/runs/{id}/stream", get(stream_run))
}

#[derive(Deserialize)]
struct GetRunQuery {
    /// When set, the project's sandbox is re-checked against the runtime
    /// and the report included alongside the ledger row.
    #[serde(default)]
    verify: bool,
}

#[derive(Serialize)]
struct RunStatusResponse {
    #[serde(flatten)]
    run: Run,
    #[serde(skip_serializing_if = "Option::is_none")]
    consistency: Option<ConsistencyReport>,
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<GetRunQuery>,
) -> Result<Json<ApiResponse<RunStatusResponse>>, ApiError> {
    let run = state.coordinator.get_run(id).await?;
    let consistency = if query.verify {
        let project = Project::find_by_id(&state.db.pool, run.project_id)
            .await?
            .ok_or(CoordinatorError::ProjectNotFound)?;
        Some(state.checker.check_project(&project).await?)
    } else {
        None
    };
    Ok(Json(ApiResponse::success(RunStatusResponse {
        run,
        consistency,
    })))
}

async fn stop_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Run>>, ApiError> {
    let run = state.coordinator.stop_run(id).await?;
    Ok(Json(ApiResponse::success(run)))
}

async fn resume_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Run>>, ApiError> {
    let run = state.coordinator.resume_run(id).await?;
    Ok(Json(ApiResponse::success(run)))
}

/// Live log stream: buffered backfill first, then events as they happen.
/// The stream ends when the run terminates.
async fn stream_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = state.coordinator.subscribe(id).await?;
    let stream = events.filter_map(|event| {
        futures::future::ready(match Event::default().json_data(&event) {
            Ok(event) => Some(Ok(event)),
            Err(err) => {
                tracing::warn!(%err, "failed to serialize log event");
                None
            }
        })
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
