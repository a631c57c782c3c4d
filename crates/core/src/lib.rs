//! `codeflow-core`: job model building blocks.
//!
//! This crate contains **pure** types (no threads, no IO).

pub mod error;
pub mod id;
pub mod job;

pub use error::{DomainError, DomainResult};
pub use id::{ArtifactKey, JobId};
pub use job::{Job, JobState, StageFailure, Transition};
