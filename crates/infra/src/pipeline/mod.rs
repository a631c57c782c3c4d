//! Sequential stage pipeline.
//!
//! ## Execution model
//!
//! ```text
//! submission ─▶ stage 1 ─▶ <job>/01-<name> ─▶ stage 2 ─▶ <job>/02-<name> ─▶ … ─▶ result
//! ```
//!
//! Each stage reads the artifact left by the previous stage (the submission
//! for the first one) and writes its own output key. The first failing stage
//! aborts the run: nothing is retried and intermediate artifacts are left in
//! place. A stage that panics counts as a failure of that stage.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use codeflow_core::{ArtifactKey, JobId, StageFailure};

use crate::artifacts::{ArtifactError, ArtifactStore};

pub mod command;
pub mod fn_stage;

pub use command::{CommandStage, OutputMode};
pub use fn_stage::FnStage;

/// Why a single stage failed. The `Display` text becomes the job's failure
/// cause.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    /// Generic failure reported by the stage itself.
    #[error("{0}")]
    Failed(String),
    #[error("{0}")]
    Artifact(#[from] ArtifactError),
    #[error("failed to start: {0}")]
    Spawn(String),
    /// External program exited unsuccessfully.
    #[error("{}", exit_message(.status, .stderr))]
    Exit { status: String, stderr: String },
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("stage did not produce its output {0}")]
    MissingOutput(ArtifactKey),
}

fn exit_message(status: &str, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {stderr}")
    }
}

impl StageError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Everything a stage needs for one run.
pub struct StageContext<'a> {
    pub job_id: JobId,
    /// 1-based position of the stage
    pub position: usize,
    pub input: &'a ArtifactKey,
    /// Key the stage is expected to write
    pub output: &'a ArtifactKey,
    pub store: &'a dyn ArtifactStore,
}

/// One step of the pipeline.
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Consume `ctx.input` and produce an artifact, returning its key
    /// (normally `ctx.output`).
    fn run(&self, ctx: &StageContext<'_>) -> Result<ArtifactKey, StageError>;
}

/// Output of a successful pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutput {
    pub key: ArtifactKey,
    pub content: String,
}

/// Runs a fixed, ordered list of stages.
pub struct PipelineRunner {
    stages: Vec<Arc<dyn Stage>>,
    store: Arc<dyn ArtifactStore>,
}

impl core::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl PipelineRunner {
    pub fn new(stages: Vec<Arc<dyn Stage>>, store: Arc<dyn ArtifactStore>) -> Self {
        Self { stages, store }
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage in order against `submission`.
    ///
    /// An empty pipeline returns the submission itself.
    pub fn run(&self, job_id: JobId, submission: &ArtifactKey) -> Result<PipelineOutput, StageFailure> {
        let mut current = submission.clone();

        for (idx, stage) in self.stages.iter().enumerate() {
            let position = idx + 1;
            let output = ArtifactKey::stage_output(job_id, position, stage.name());
            let ctx = StageContext {
                job_id,
                position,
                input: &current,
                output: &output,
                store: self.store.as_ref(),
            };

            debug!(job_id = %job_id, stage = stage.name(), position, "stage started");
            let started = Instant::now();

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| stage.run(&ctx)))
                .unwrap_or_else(|payload| Err(StageError::Failed(panic_message(payload))));

            match outcome {
                Ok(key) => {
                    debug!(
                        job_id = %job_id,
                        stage = stage.name(),
                        position,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "stage finished"
                    );
                    current = key;
                }
                Err(err) => {
                    warn!(
                        job_id = %job_id,
                        stage = stage.name(),
                        position,
                        error = %err,
                        "stage failed"
                    );
                    return Err(StageFailure::new(position, stage.name(), err.to_string()));
                }
            }
        }

        let content = self.store.get(&current).map_err(|e| {
            let (position, name) = match self.stages.last() {
                Some(stage) => (self.stages.len(), stage.name().to_string()),
                None => (0, "submission".to_string()),
            };
            StageFailure::new(position, name, e.to_string())
        })?;

        Ok(PipelineOutput {
            key: current,
            content,
        })
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("stage panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::InMemoryArtifactStore;

    fn setup(stages: Vec<Arc<dyn Stage>>) -> (PipelineRunner, Arc<InMemoryArtifactStore>, JobId, ArtifactKey) {
        let store = InMemoryArtifactStore::arc();
        let job_id = JobId::new();
        let submission = ArtifactKey::submission(job_id);
        store.put(&submission, "Y").unwrap();
        (PipelineRunner::new(stages, store.clone()), store, job_id, submission)
    }

    #[test]
    fn stages_chain_outputs() {
        let (runner, store, job_id, submission) = setup(vec![
            FnStage::shared("upper", |s: &str| Ok(s.to_uppercase() + "1")),
            FnStage::shared("answer", |s: &str| {
                assert_eq!(s, "Y1");
                Ok("42".to_string())
            }),
        ]);

        let out = runner.run(job_id, &submission).unwrap();

        assert_eq!(out.content, "42");
        assert_eq!(out.key, ArtifactKey::stage_output(job_id, 2, "answer"));
        assert_eq!(
            store.get(&ArtifactKey::stage_output(job_id, 1, "upper")).unwrap(),
            "Y1"
        );
    }

    #[test]
    fn first_failure_aborts_the_run() {
        let (runner, store, job_id, submission) = setup(vec![
            FnStage::shared("ok", |s: &str| Ok(s.to_string())),
            FnStage::shared("broken", |_: &str| Err("bad input".to_string())),
            FnStage::shared("never", |_: &str| -> Result<String, String> {
                panic!("must not run")
            }),
        ]);

        let failure = runner.run(job_id, &submission).unwrap_err();

        assert_eq!(failure, StageFailure::new(2, "broken", "bad input"));
        // Intermediate output of stage 1 is kept.
        assert!(store.get(&ArtifactKey::stage_output(job_id, 1, "ok")).is_ok());
        assert!(store.get(&ArtifactKey::stage_output(job_id, 3, "never")).is_err());
    }

    #[test]
    fn panicking_stage_is_a_stage_failure() {
        let (runner, _store, job_id, submission) = setup(vec![FnStage::shared(
            "explodes",
            |_: &str| -> Result<String, String> { panic!("kaboom") },
        )]);

        let failure = runner.run(job_id, &submission).unwrap_err();

        assert_eq!(failure.stage, 1);
        assert_eq!(failure.stage_name, "explodes");
        assert!(failure.cause.contains("kaboom"), "{}", failure.cause);
    }

    #[test]
    fn empty_pipeline_returns_submission() {
        let (runner, _store, job_id, submission) = setup(vec![]);

        let out = runner.run(job_id, &submission).unwrap();

        assert_eq!(out.key, submission);
        assert_eq!(out.content, "Y");
    }

    #[test]
    fn exit_error_shows_status_and_stderr() {
        let err = StageError::Exit {
            status: "exit status: 2".to_string(),
            stderr: "  Traceback: boom\n".to_string(),
        };
        assert_eq!(err.to_string(), "exit status: 2: Traceback: boom");

        let quiet = StageError::Exit {
            status: "exit status: 2".to_string(),
            stderr: String::new(),
        };
        assert_eq!(quiet.to_string(), "exit status: 2");
    }
}
