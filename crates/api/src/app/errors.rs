use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use codeflow_core::JobId;
use codeflow_infra::jobs::{RegistryError, SubmitError};
use codeflow_infra::QueryError;

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        e @ SubmitError::QueueFull { .. } => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_full", e.to_string())
        }
        e @ SubmitError::ShuttingDown => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "shutting_down", e.to_string())
        }
        e @ (SubmitError::Registry(_) | SubmitError::Artifact(_)) => {
            tracing::error!(error = %e, "submission failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
        }
    }
}

pub fn registry_error_to_response(err: RegistryError) -> axum::response::Response {
    match err {
        e @ RegistryError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", e.to_string()),
        e => {
            tracing::error!(error = %e, "registry failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
        }
    }
}

pub fn query_error_to_response(err: QueryError) -> axum::response::Response {
    match err {
        QueryError::Registry(e) => registry_error_to_response(e),
        e @ QueryError::Artifact(_) => {
            tracing::error!(error = %e, "job result unreadable");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "artifact_error", e.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}

/// Run blocking orchestrator work off the async runtime.
pub async fn blocking<T, F>(f: F) -> Result<T, axum::response::Response>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        tracing::error!(error = %e, "blocking task failed");
        json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "task failed")
    })
}
