//! Submission intake, bounded queue and worker pool.
//!
//! ```text
//! submit ─▶ validate ─▶ registry.create ─▶ artifacts.put ─▶ [bounded queue] ─▶ worker N
//!                                                                             │
//!          registry.transition(Start) ─▶ publish ─▶ runner.run ─▶ transition(Succeed|Fail) ─▶ publish
//! ```
//!
//! Jobs that never make it into the queue (full queue, shutdown) are rolled
//! back: their record is discarded and their submission artifact deleted.

use std::io;
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use codeflow_core::{ArtifactKey, JobId, JobState, Transition};
use codeflow_events::JobEvent;

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::jobs::notifier::JobNotifier;
use crate::jobs::registry::{JobRegistry, RegistryError};
use crate::pipeline::PipelineRunner;

/// What `submit` does when the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Fail fast with [`SubmitError::QueueFull`].
    #[default]
    Reject,
    /// Block the caller until a slot frees.
    Block,
}

impl FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "block" => Ok(Self::Block),
            other => Err(format!("unknown backpressure policy `{other}` (expected reject or block)")),
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Prefix for worker thread names
    pub name: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    /// Largest accepted submission, in bytes
    pub max_submission_bytes: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "codeflow-worker".to_string(),
            workers: 2,
            queue_capacity: 64,
            backpressure: BackpressurePolicy::Reject,
            max_submission_bytes: 1024 * 1024,
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = policy;
        self
    }

    pub fn with_max_submission_bytes(mut self, max: usize) -> Self {
        self.max_submission_bytes = max;
        self
    }
}

/// Synchronous submission failure. No job exists afterwards.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid submission: {0}")]
    Validation(String),
    #[error("job queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("dispatcher is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to store submission: {0}")]
    Artifact(#[from] ArtifactError),
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    pub submitted: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub running: usize,
}

#[derive(Debug)]
struct QueuedJob {
    id: JobId,
    submission: ArtifactKey,
}

/// State shared with the worker threads.
struct Shared {
    registry: Arc<dyn JobRegistry>,
    runner: PipelineRunner,
    notifier: Arc<JobNotifier>,
    receiver: Mutex<Receiver<QueuedJob>>,
    stats: Mutex<DispatcherStats>,
}

impl Shared {
    fn stats(&self) -> std::sync::MutexGuard<'_, DispatcherStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Accepts submissions and runs them on a fixed pool of worker threads.
pub struct Dispatcher {
    config: DispatcherConfig,
    artifacts: Arc<dyn ArtifactStore>,
    sender: Mutex<Option<SyncSender<QueuedJob>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("runner", &self.shared.runner)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create the dispatcher and its queue. Submissions are accepted right
    /// away; nothing runs until [`Dispatcher::start`].
    pub fn new(
        config: DispatcherConfig,
        registry: Arc<dyn JobRegistry>,
        artifacts: Arc<dyn ArtifactStore>,
        runner: PipelineRunner,
        notifier: Arc<JobNotifier>,
    ) -> Self {
        let mut config = config;
        config.workers = config.workers.max(1);
        config.queue_capacity = config.queue_capacity.max(1);

        let (sender, receiver) = mpsc::sync_channel(config.queue_capacity);
        let shared = Arc::new(Shared {
            registry,
            runner,
            notifier,
            receiver: Mutex::new(receiver),
            stats: Mutex::new(DispatcherStats::default()),
        });

        Self {
            config,
            artifacts,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(Vec::new()),
            shared,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Spawn the worker pool. Calling it again while workers run, or after
    /// [`Dispatcher::shutdown`], is a no-op.
    pub fn start(&self) -> io::Result<()> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if !workers.is_empty() {
            return Ok(());
        }
        if self.sender.lock().unwrap_or_else(PoisonError::into_inner).is_none() {
            debug!("dispatcher already shut down, not starting workers");
            return Ok(());
        }

        for worker in 0..self.config.workers {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{worker}", self.config.name))
                .spawn(move || worker_loop(worker, &shared))?;
            workers.push(handle);
        }

        info!(
            workers = self.config.workers,
            queue_capacity = self.config.queue_capacity,
            backpressure = ?self.config.backpressure,
            stages = ?self.shared.runner.stage_names(),
            "dispatcher started"
        );
        Ok(())
    }

    /// Accept a submission and return its job id without waiting for it to
    /// run.
    pub fn submit(&self, content: &str) -> Result<JobId, SubmitError> {
        self.validate(content)?;

        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SubmitError::ShuttingDown)?;

        let id = self.shared.registry.create()?;
        let key = ArtifactKey::submission(id);
        if let Err(e) = self.artifacts.put(&key, content) {
            self.discard(id, &key);
            return Err(e.into());
        }

        let queued = QueuedJob {
            id,
            submission: key.clone(),
        };
        let enqueued = match self.config.backpressure {
            BackpressurePolicy::Reject => sender.try_send(queued).map_err(|e| match e {
                TrySendError::Full(_) => SubmitError::QueueFull {
                    capacity: self.config.queue_capacity,
                },
                TrySendError::Disconnected(_) => SubmitError::ShuttingDown,
            }),
            BackpressurePolicy::Block => sender.send(queued).map_err(|_| SubmitError::ShuttingDown),
        };

        if let Err(err) = enqueued {
            self.discard(id, &key);
            self.shared.stats().rejected += 1;
            warn!(job_id = %id, error = %err, "submission rejected");
            return Err(err);
        }

        self.shared.stats().submitted += 1;
        info!(job_id = %id, bytes = content.len(), "job submitted");
        Ok(id)
    }

    pub fn stats(&self) -> DispatcherStats {
        self.shared.stats().clone()
    }

    /// Close the queue, let workers finish everything already queued, and
    /// join them. Later submissions fail with `ShuttingDown`.
    ///
    /// If the pool was never started, the queue is drained on the calling
    /// thread instead.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let count = workers.len();
        if count == 0 {
            debug!("no workers running, draining queue inline");
            worker_loop(0, &self.shared);
        }
        for handle in workers {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }

        info!(workers = count, "dispatcher stopped");
    }

    fn validate(&self, content: &str) -> Result<(), SubmitError> {
        if content.trim().is_empty() {
            return Err(SubmitError::Validation("code must not be empty".to_string()));
        }
        if content.len() > self.config.max_submission_bytes {
            return Err(SubmitError::Validation(format!(
                "code is {} bytes, limit is {}",
                content.len(),
                self.config.max_submission_bytes
            )));
        }
        Ok(())
    }

    fn discard(&self, id: JobId, key: &ArtifactKey) {
        if let Err(e) = self.shared.registry.discard(id) {
            error!(job_id = %id, error = %e, "failed to discard rejected job");
        }
        if let Err(e) = self.artifacts.delete(key) {
            warn!(job_id = %id, key = %key, error = %e, "failed to delete rejected submission");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker: usize, shared: &Shared) {
    debug!(worker, "worker started");

    loop {
        let next = match shared.receiver.lock() {
            Ok(receiver) => receiver.recv(),
            Err(_) => {
                error!(worker, "job queue lock poisoned");
                break;
            }
        };
        match next {
            Ok(job) => process(worker, shared, job),
            // Queue closed and drained.
            Err(_) => break,
        }
    }

    debug!(worker, "worker stopped");
}

fn process(worker: usize, shared: &Shared, job: QueuedJob) {
    let id = job.id;

    let running = match shared.registry.transition(id, Transition::Start) {
        Ok(running) => running,
        Err(e) => {
            error!(worker, job_id = %id, error = %e, "cannot start job");
            return;
        }
    };
    shared.stats().running += 1;
    shared.notifier.publish(JobEvent::from_job(&running, None));
    debug!(worker, job_id = %id, "job running");

    let started = Instant::now();
    let (transition, result) = match shared.runner.run(id, &job.submission) {
        Ok(output) => (Transition::Succeed { result_key: output.key }, Some(output.content)),
        Err(failure) => (Transition::Fail { error: failure }, None),
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let finished = shared.registry.transition(id, transition);
    {
        let mut stats = shared.stats();
        stats.running = stats.running.saturating_sub(1);
        if let Ok(done) = &finished {
            match done.state {
                JobState::Succeeded => stats.succeeded += 1,
                _ => stats.failed += 1,
            }
        }
    }

    match finished {
        Ok(done) => {
            match &done.error {
                Some(failure) => warn!(worker, job_id = %id, elapsed_ms, %failure, "job failed"),
                None => info!(worker, job_id = %id, elapsed_ms, "job succeeded"),
            }
            shared.notifier.publish(JobEvent::from_job(&done, result));
        }
        Err(e) => error!(worker, job_id = %id, error = %e, "cannot finish job"),
    }
}
