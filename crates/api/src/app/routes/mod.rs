use axum::{routing::get, Router};

pub mod jobs;
pub mod system;

/// Router for the job endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/jobs", get(jobs::list_jobs).post(jobs::submit_job))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/events", get(jobs::stream_job_events))
}
