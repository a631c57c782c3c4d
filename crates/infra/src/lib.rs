//! Orchestration layer: artifact storage, stage pipeline, job registry,
//! dispatcher with its worker pool, and job notifications.

pub mod artifacts;
pub mod config;
pub mod jobs;
pub mod orchestrator;
pub mod pipeline;

pub use config::{ConfigError, OrchestratorConfig, StageConfig};
pub use orchestrator::{JobStatus, Orchestrator, OrchestratorStats, QueryError};
