use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use sandbox::SandboxError;
use services::services::{CoordinatorError, LifecycleError};
use thiserror::Error;

use crate::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Lifecycle(err) => match err {
                LifecycleError::ProjectNotFound => StatusCode::NOT_FOUND,
                LifecycleError::InvalidTransition { .. } | LifecycleError::RunActive => {
                    StatusCode::CONFLICT
                }
                LifecycleError::InvalidRepo(_) => StatusCode::BAD_REQUEST,
                LifecycleError::Timeout(_) | LifecycleError::Sandbox(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                LifecycleError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Coordinator(err) => match err {
                CoordinatorError::ProjectNotFound | CoordinatorError::RunNotFound => {
                    StatusCode::NOT_FOUND
                }
                CoordinatorError::ProjectNotReady(_)
                | CoordinatorError::RunAlreadyActive
                | CoordinatorError::InvalidTransition { .. } => StatusCode::CONFLICT,
                CoordinatorError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                CoordinatorError::Sandbox(_) => StatusCode::SERVICE_UNAVAILABLE,
                CoordinatorError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Sandbox(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(ApiResponse::<()>::error(self.to_string()))).into_response()
    }
}
