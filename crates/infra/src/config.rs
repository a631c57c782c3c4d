//! Orchestrator configuration loaded from `CODEFLOW_*` environment variables.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::jobs::{BackpressurePolicy, DispatcherConfig};
use crate::pipeline::{CommandStage, OutputMode, Stage};

pub const ENV_WORKERS: &str = "CODEFLOW_WORKERS";
pub const ENV_QUEUE_CAPACITY: &str = "CODEFLOW_QUEUE_CAPACITY";
pub const ENV_BACKPRESSURE: &str = "CODEFLOW_BACKPRESSURE";
pub const ENV_MAX_SUBMISSION_BYTES: &str = "CODEFLOW_MAX_SUBMISSION_BYTES";
pub const ENV_ARTIFACT_DIR: &str = "CODEFLOW_ARTIFACT_DIR";
pub const ENV_STAGES: &str = "CODEFLOW_STAGES";
pub const ENV_JOB_RETENTION_SECS: &str = "CODEFLOW_JOB_RETENTION_SECS";

/// Artifact root used when external stages are configured without
/// `CODEFLOW_ARTIFACT_DIR`.
pub const DEFAULT_ARTIFACT_DIR: &str = "artifacts";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

impl ConfigError {
    fn invalid(var: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            var,
            message: message.into(),
        }
    }
}

/// One external pipeline stage as written in `CODEFLOW_STAGES`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub output: OutputMode,
}

impl StageConfig {
    pub fn build(&self) -> Arc<dyn Stage> {
        let mut stage = CommandStage::new(&self.name, &self.program)
            .args(self.args.iter().cloned())
            .output_mode(self.output);
        if let Some(dir) = &self.working_dir {
            stage = stage.working_dir(dir);
        }
        if let Some(secs) = self.timeout_secs {
            stage = stage.timeout(Duration::from_secs(secs));
        }
        Arc::new(stage)
    }
}

/// The analysis pipeline the service ships with: three Python scripts, each
/// reading the previous artifact and writing its own.
pub fn default_stages() -> Vec<StageConfig> {
    [
        ("api", "api.py"),
        ("slither", "slither.py"),
        ("optimize", "DecompilationOptimization.py"),
    ]
    .into_iter()
    .map(|(name, script)| StageConfig {
        name: name.to_string(),
        program: "python3".to_string(),
        args: vec![script.to_string(), "{input}".to_string(), "{output}".to_string()],
        working_dir: None,
        timeout_secs: None,
        output: OutputMode::File,
    })
    .collect()
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub dispatcher: DispatcherConfig,
    /// Root of the filesystem artifact store. `None` keeps artifacts in
    /// memory, which only works with in-process stages.
    pub artifact_dir: Option<PathBuf>,
    pub stages: Vec<StageConfig>,
    /// How long terminal job records are kept
    pub job_retention: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            artifact_dir: None,
            stages: default_stages(),
            job_retention: Duration::from_secs(3600),
        }
    }
}

impl OrchestratorConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable lookup. Unset or blank variables keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(raw) = get(ENV_WORKERS) {
            config.dispatcher.workers = parse_positive(ENV_WORKERS, &raw)?;
        }
        if let Some(raw) = get(ENV_QUEUE_CAPACITY) {
            config.dispatcher.queue_capacity = parse_positive(ENV_QUEUE_CAPACITY, &raw)?;
        }
        if let Some(raw) = get(ENV_BACKPRESSURE) {
            config.dispatcher.backpressure = raw
                .parse::<BackpressurePolicy>()
                .map_err(|e| ConfigError::invalid(ENV_BACKPRESSURE, e))?;
        }
        if let Some(raw) = get(ENV_MAX_SUBMISSION_BYTES) {
            config.dispatcher.max_submission_bytes = parse_positive(ENV_MAX_SUBMISSION_BYTES, &raw)?;
        }
        if let Some(raw) = get(ENV_ARTIFACT_DIR) {
            config.artifact_dir = Some(PathBuf::from(raw));
        }
        if let Some(raw) = get(ENV_STAGES) {
            config.stages = serde_json::from_str(&raw)
                .map_err(|e| ConfigError::invalid(ENV_STAGES, e.to_string()))?;
        }
        if let Some(raw) = get(ENV_JOB_RETENTION_SECS) {
            let secs = raw
                .parse::<u64>()
                .map_err(|e| ConfigError::invalid(ENV_JOB_RETENTION_SECS, e.to_string()))?;
            config.job_retention = Duration::from_secs(secs);
        }

        if config.artifact_dir.is_none() && !config.stages.is_empty() {
            config.artifact_dir = Some(PathBuf::from(DEFAULT_ARTIFACT_DIR));
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(ConfigError::invalid(ENV_STAGES, "stage name must not be empty"));
            }
            if stage.program.trim().is_empty() {
                return Err(ConfigError::invalid(
                    ENV_STAGES,
                    format!("stage `{}` has no program", stage.name),
                ));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(ConfigError::invalid(
                    ENV_STAGES,
                    format!("duplicate stage name `{}`", stage.name),
                ));
            }
        }
        Ok(())
    }

    pub fn build_stages(&self) -> Vec<Arc<dyn Stage>> {
        self.stages.iter().map(StageConfig::build).collect()
    }
}

fn parse_positive(var: &'static str, raw: &str) -> Result<usize, ConfigError> {
    match raw.parse::<usize>() {
        Ok(0) => Err(ConfigError::invalid(var, "must be greater than zero")),
        Ok(n) => Ok(n),
        Err(e) => Err(ConfigError::invalid(var, e.to_string())),
    }
}
