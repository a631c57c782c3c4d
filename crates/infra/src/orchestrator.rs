//! The orchestration facade: one instance per process, built at startup,
//! started and shut down explicitly, shared by `Arc` with the transport.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use codeflow_core::{Job, JobId, JobState, StageFailure};

use crate::artifacts::{ArtifactError, ArtifactStore, FsArtifactStore, InMemoryArtifactStore};
use crate::config::OrchestratorConfig;
use crate::jobs::{
    Dispatcher, DispatcherConfig, DispatcherStats, InMemoryJobRegistry, JobEventStream,
    JobNotifier, JobRegistry, RegistryError, RegistryStats, SubmitError,
};
use crate::pipeline::{PipelineRunner, Stage};

/// Point-in-time view of a job for callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageFailure>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("result unavailable: {0}")]
    Artifact(#[from] ArtifactError),
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub dispatcher: DispatcherStats,
    pub jobs: RegistryStats,
}

pub struct Orchestrator {
    registry: Arc<dyn JobRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    notifier: Arc<JobNotifier>,
    dispatcher: Dispatcher,
    job_retention: Duration,
}

impl core::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("dispatcher", &self.dispatcher)
            .field("job_retention", &self.job_retention)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build the in-memory registry, the configured artifact store and the
    /// external stage pipeline.
    pub fn from_config(config: &OrchestratorConfig) -> io::Result<Self> {
        let artifacts: Arc<dyn ArtifactStore> = match &config.artifact_dir {
            Some(root) => Arc::new(FsArtifactStore::open(root)?),
            None => InMemoryArtifactStore::arc(),
        };

        let orchestrator = Self::with_components(
            config.dispatcher.clone(),
            InMemoryJobRegistry::arc(),
            artifacts,
            config.build_stages(),
        )
        .with_job_retention(config.job_retention);

        info!(
            artifact_dir = ?config.artifact_dir,
            stages = config.stages.len(),
            "orchestrator configured"
        );
        Ok(orchestrator)
    }

    pub fn with_components(
        dispatcher: DispatcherConfig,
        registry: Arc<dyn JobRegistry>,
        artifacts: Arc<dyn ArtifactStore>,
        stages: Vec<Arc<dyn Stage>>,
    ) -> Self {
        let notifier = Arc::new(JobNotifier::new(registry.clone(), artifacts.clone()));
        let runner = PipelineRunner::new(stages, artifacts.clone());
        let dispatcher = Dispatcher::new(
            dispatcher,
            registry.clone(),
            artifacts.clone(),
            runner,
            notifier.clone(),
        );

        Self {
            registry,
            artifacts,
            notifier,
            dispatcher,
            job_retention: Duration::from_secs(3600),
        }
    }

    pub fn with_job_retention(mut self, retention: Duration) -> Self {
        self.job_retention = retention;
        self
    }

    pub fn job_retention(&self) -> Duration {
        self.job_retention
    }

    pub fn start(&self) -> io::Result<()> {
        self.dispatcher.start()
    }

    pub fn submit(&self, content: &str) -> Result<JobId, SubmitError> {
        self.dispatcher.submit(content)
    }

    /// Current state of a job, with the result content once it succeeded.
    pub fn status(&self, id: JobId) -> Result<JobStatus, QueryError> {
        let job = self.registry.get(id)?;
        let result = match &job.result_key {
            Some(key) => Some(self.artifacts.get(key)?),
            None => None,
        };

        Ok(JobStatus {
            job_id: job.id,
            state: job.state,
            result,
            error: job.error,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        })
    }

    pub fn subscribe(&self, id: JobId) -> Result<JobEventStream, RegistryError> {
        self.notifier.subscribe(id)
    }

    pub fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, RegistryError> {
        self.registry.list(state, limit)
    }

    pub fn stats(&self) -> Result<OrchestratorStats, RegistryError> {
        Ok(OrchestratorStats {
            dispatcher: self.dispatcher.stats(),
            jobs: self.registry.stats()?,
        })
    }

    /// Drop terminal job records older than the retention period.
    pub fn purge_finished(&self) -> Result<usize, RegistryError> {
        let purged = self.registry.purge_finished(self.job_retention)?;
        if purged > 0 {
            info!(purged, "purged finished jobs");
        }
        Ok(purged)
    }

    /// Stop accepting work and wait for queued and running jobs to finish.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}
