//! Job lifecycle: registry of records, dispatcher with its worker pool, and
//! the notifier that streams state changes.
//!
//! ## Components
//!
//! - `JobRegistry`: canonical job records and their legal transitions
//! - `Dispatcher`: validation, bounded queue with backpressure, worker pool
//! - `JobNotifier`: fire-and-forget publish, finite per-job event streams

pub mod dispatcher;
pub mod notifier;
pub mod registry;

pub use dispatcher::{BackpressurePolicy, Dispatcher, DispatcherConfig, DispatcherStats, SubmitError};
pub use notifier::{JobEventStream, JobNotifier, StreamPoll};
pub use registry::{InMemoryJobRegistry, JobRegistry, RegistryError, RegistryStats};
