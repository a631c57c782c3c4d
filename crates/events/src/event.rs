use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use codeflow_core::{Job, JobId, JobState, StageFailure};

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "job.succeeded").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred.
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// A job state change as seen by subscribers.
///
/// `result` carries the final artifact content on `Succeeded`; `error` the
/// failure descriptor on `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageFailure>,
    pub occurred_at: DateTime<Utc>,
}

impl JobEvent {
    /// Snapshot event for a job record.
    ///
    /// `result` is the content behind `job.result_key`, resolved by the caller.
    pub fn from_job(job: &Job, result: Option<String>) -> Self {
        let occurred_at = match job.state {
            JobState::Pending => job.created_at,
            JobState::Running => job.started_at.unwrap_or(job.created_at),
            JobState::Succeeded | JobState::Failed => job.finished_at.unwrap_or(job.created_at),
        };

        Self {
            job_id: job.id,
            state: job.state,
            result: if job.state == JobState::Succeeded { result } else { None },
            error: job.error.clone(),
            occurred_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

impl Event for JobEvent {
    fn event_type(&self) -> &'static str {
        match self.state {
            JobState::Pending => "job.pending",
            JobState::Running => "job.running",
            JobState::Succeeded => "job.succeeded",
            JobState::Failed => "job.failed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeflow_core::{ArtifactKey, Transition};

    #[test]
    fn snapshot_of_failed_job_carries_failure() {
        let id = JobId::new();
        let mut job = Job::new(id, ArtifactKey::submission(id));
        job.apply(Transition::Start).unwrap();
        job.apply(Transition::Fail {
            error: StageFailure::new(2, "slither", "bad input"),
        })
        .unwrap();

        let ev = JobEvent::from_job(&job, Some("ignored".to_string()));
        assert_eq!(ev.state, JobState::Failed);
        assert_eq!(ev.result, None);
        assert_eq!(ev.error.as_ref().map(|e| e.stage), Some(2));
        assert_eq!(ev.event_type(), "job.failed");
        assert_eq!(ev.occurred_at, job.finished_at.unwrap());
    }

    #[test]
    fn serialized_event_omits_empty_payload() {
        let id = JobId::new();
        let job = Job::new(id, ArtifactKey::submission(id));
        let json = serde_json::to_value(JobEvent::from_job(&job, None)).unwrap();

        assert_eq!(json["state"], "pending");
        assert!(json.get("result").is_none());
        assert!(json.get("error").is_none());
    }
}
