//! Job lifecycle model.
//!
//! A job moves `Pending -> Running -> {Succeeded | Failed}` and never leaves a
//! terminal state. The payload of the terminal state (result key or failure)
//! is written together with the state change and is frozen afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{ArtifactKey, JobId};

/// Lifecycle state of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, waiting for a worker
    Pending,
    /// Pipeline is executing
    Running,
    /// Pipeline finished; result artifact available
    Succeeded,
    /// A stage failed; failure descriptor available
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    /// Whether `next` is the legal successor of `self`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            other => Err(DomainError::validation(format!("unknown job state `{other}`"))),
        }
    }
}

/// Why a pipeline run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    /// 1-based position of the failing stage in the pipeline
    pub stage: usize,
    pub stage_name: String,
    /// Raw error text or exit status reported by the stage
    pub cause: String,
}

impl StageFailure {
    pub fn new(stage: usize, stage_name: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            stage,
            stage_name: stage_name.into(),
            cause: cause.into(),
        }
    }
}

impl core::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "stage {} ({}) failed: {}", self.stage, self.stage_name, self.cause)
    }
}

/// A requested state change together with the data it records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Start,
    Succeed { result_key: ArtifactKey },
    Fail { error: StageFailure },
}

impl Transition {
    pub fn target(&self) -> JobState {
        match self {
            Transition::Start => JobState::Running,
            Transition::Succeed { .. } => JobState::Succeeded,
            Transition::Fail { .. } => JobState::Failed,
        }
    }
}

/// Canonical record of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub state: JobState,
    pub submission_key: ArtifactKey,
    /// Set only on `Succeeded`
    pub result_key: Option<ArtifactKey>,
    /// Set only on `Failed`
    pub error: Option<StageFailure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new `Pending` job.
    pub fn new(id: JobId, submission_key: ArtifactKey) -> Self {
        Self {
            id,
            state: JobState::Pending,
            submission_key,
            result_key: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply a transition, or reject it without touching the record.
    pub fn apply(&mut self, transition: Transition) -> DomainResult<()> {
        let to = transition.target();
        if !self.state.can_transition_to(to) {
            return Err(DomainError::InvalidTransition {
                id: self.id,
                from: self.state,
                to,
            });
        }

        let now = Utc::now();
        match transition {
            Transition::Start => {
                self.started_at = Some(now);
            }
            Transition::Succeed { result_key } => {
                self.result_key = Some(result_key);
                self.finished_at = Some(now);
            }
            Transition::Fail { error } => {
                self.error = Some(error);
                self.finished_at = Some(now);
            }
        }
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_job() -> Job {
        let id = JobId::new();
        Job::new(id, ArtifactKey::submission(id))
    }

    #[test]
    fn state_round_trips_through_its_name() {
        for state in [JobState::Pending, JobState::Running, JobState::Succeeded, JobState::Failed] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!(matches!("done".parse::<JobState>(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn job_lifecycle_to_success() {
        let mut job = pending_job();
        assert_eq!(job.state, JobState::Pending);

        job.apply(Transition::Start).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert!(job.started_at.is_some());
        assert!(job.finished_at.is_none());

        let key = ArtifactKey::stage_output(job.id, 3, "optimize");
        job.apply(Transition::Succeed { result_key: key.clone() }).unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.result_key, Some(key));
        assert!(job.error.is_none());
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn pending_cannot_skip_to_terminal() {
        let mut job = pending_job();
        let before = job.clone();

        let err = job
            .apply(Transition::Succeed {
                result_key: ArtifactKey::new("x"),
            })
            .unwrap_err();

        assert_eq!(
            err,
            DomainError::InvalidTransition {
                id: job.id,
                from: JobState::Pending,
                to: JobState::Succeeded,
            }
        );
        assert_eq!(job, before);
    }

    #[test]
    fn terminal_state_is_frozen() {
        let mut job = pending_job();
        job.apply(Transition::Start).unwrap();
        job.apply(Transition::Fail {
            error: StageFailure::new(2, "slither", "bad input"),
        })
        .unwrap();
        let frozen = job.clone();

        assert!(job.apply(Transition::Start).is_err());
        assert!(job
            .apply(Transition::Succeed {
                result_key: ArtifactKey::new("late"),
            })
            .is_err());
        assert!(job
            .apply(Transition::Fail {
                error: StageFailure::new(1, "other", "late"),
            })
            .is_err());
        assert_eq!(job, frozen);
    }

    #[test]
    fn state_names_are_snake_case() {
        assert_eq!(serde_json::to_value(JobState::Succeeded).unwrap(), "succeeded");
        assert_eq!(JobState::Running.to_string(), "running");
    }

    #[cfg(test)]
    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn any_transition() -> impl Strategy<Value = Transition> {
            prop_oneof![
                Just(Transition::Start),
                "[a-z]{1,8}".prop_map(|k| Transition::Succeed {
                    result_key: ArtifactKey::new(k),
                }),
                ("[a-z]{1,8}", 1usize..4).prop_map(|(cause, stage)| Transition::Fail {
                    error: StageFailure::new(stage, "stage", cause),
                }),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 500,
                ..ProptestConfig::default()
            })]

            /// Property: observed states are a prefix of Pending, Running, terminal.
            #[test]
            fn observed_states_follow_the_lifecycle(
                transitions in proptest::collection::vec(any_transition(), 0..12)
            ) {
                let mut job = pending_job();
                let mut observed = vec![job.state];

                for t in transitions {
                    if job.apply(t).is_ok() {
                        observed.push(job.state);
                    }
                }

                prop_assert!(observed.len() <= 3);
                prop_assert_eq!(observed[0], JobState::Pending);
                if observed.len() > 1 {
                    prop_assert_eq!(observed[1], JobState::Running);
                }
                if observed.len() > 2 {
                    prop_assert!(observed[2].is_terminal());
                }
            }

            /// Property: payload is present exactly for the matching terminal state.
            #[test]
            fn payload_matches_state(
                transitions in proptest::collection::vec(any_transition(), 0..12)
            ) {
                let mut job = pending_job();
                for t in transitions {
                    let _ = job.apply(t);
                }

                prop_assert_eq!(job.result_key.is_some(), job.state == JobState::Succeeded);
                prop_assert_eq!(job.error.is_some(), job.state == JobState::Failed);
                prop_assert_eq!(job.finished_at.is_some(), job.state.is_terminal());
            }
        }
    }
}
