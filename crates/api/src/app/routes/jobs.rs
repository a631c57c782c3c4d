use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use tokio::sync::mpsc::unbounded_channel;
use tokio_stream::wrappers::UnboundedReceiverStream;

use codeflow_core::JobState;
use codeflow_events::JobEvent;
use codeflow_infra::jobs::{JobEventStream, StreamPoll};
use codeflow_infra::Orchestrator;

use crate::app::{dto, errors};

/// How often a streaming task checks whether its client went away.
const CLIENT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// POST /jobs
///
/// Accepts `{"code": "<source>"}` and answers `202` with the job id; the
/// pipeline runs in the background.
pub async fn submit_job(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    body: Result<Json<dto::SubmitJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let code = match body {
        Ok(Json(dto::SubmitJobRequest { code: Some(code) })) => code,
        Ok(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "missing \"code\" field");
        }
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text());
        }
    };

    // Under the blocking backpressure policy `submit` may wait for a slot.
    let submitted = match errors::blocking(move || orchestrator.submit(&code)).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match submitted {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(dto::SubmitJobResponse {
                job_id,
                state: JobState::Pending,
            }),
        )
            .into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

/// GET /jobs?state=<state>&limit=<n>
pub async fn list_jobs(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let state = match query.state.as_deref().map(str::parse::<JobState>).transpose() {
        Ok(s) => s,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_state", e.to_string()),
    };
    let limit = query
        .limit
        .unwrap_or(dto::DEFAULT_LIST_LIMIT)
        .min(dto::MAX_LIST_LIMIT);

    let jobs = match orchestrator.list(state, limit) {
        Ok(jobs) => jobs,
        Err(e) => return errors::registry_error_to_response(e),
    };
    let stats = match orchestrator.stats() {
        Ok(stats) => stats,
        Err(e) => return errors::registry_error_to_response(e),
    };

    Json(dto::JobListResponse {
        jobs: jobs.into_iter().map(Into::into).collect(),
        stats,
    })
    .into_response()
}

/// GET /jobs/:id
pub async fn get_job(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // Reading the result may touch the filesystem.
    let status = match errors::blocking(move || orchestrator.status(job_id)).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match status {
        Ok(status) => Json(status).into_response(),
        Err(e) => errors::query_error_to_response(e),
    }
}

/// GET /jobs/:id/events
///
/// Server-Sent Events: one `job` event per state change, starting with the
/// current state. The stream ends after the terminal event.
pub async fn stream_job_events(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // The snapshot of a finished job reads its result artifact.
    let events = match errors::blocking(move || orchestrator.subscribe(job_id)).await {
        Ok(Ok(events)) => events,
        Ok(Err(e)) => return errors::registry_error_to_response(e),
        Err(resp) => return resp,
    };

    let (tx, rx) = unbounded_channel::<Result<SseEvent, Infallible>>();

    // The job stream blocks; forward it from a blocking task.
    tokio::task::spawn_blocking(move || forward_events(events, tx));

    let stream = UnboundedReceiverStream::new(rx);
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

fn forward_events(
    mut events: JobEventStream,
    tx: tokio::sync::mpsc::UnboundedSender<Result<SseEvent, Infallible>>,
) {
    loop {
        match events.recv_timeout(CLIENT_CHECK_INTERVAL) {
            StreamPoll::Event(event) => {
                let Some(sse_event) = to_sse(&event) else {
                    continue;
                };
                if tx.send(Ok(sse_event)).is_err() {
                    break; // Client disconnected
                }
            }
            StreamPoll::Timeout => {
                if tx.is_closed() {
                    break;
                }
            }
            StreamPoll::Closed => break,
        }
    }
}

fn to_sse(event: &JobEvent) -> Option<SseEvent> {
    match serde_json::to_string(event) {
        Ok(json) => Some(SseEvent::default().event("job").data(json)),
        Err(e) => {
            tracing::error!(job_id = %event.job_id, error = %e, "failed to encode job event");
            None
        }
    }
}
