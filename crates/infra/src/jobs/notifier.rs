//! Job notifications: fire-and-forget publish, finite per-job event streams.
//!
//! ## Ordering
//!
//! Workers always update the registry *before* publishing. `subscribe`
//! registers on the bus *before* reading the registry snapshot. Together this
//! means a stream either sees the terminal state in its snapshot or receives
//! the terminal event on its channel; it can never miss it. Events older than
//! what the stream has already yielded are skipped, so each stream observes
//! `Pending < Running < terminal` without repeats.

use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use tracing::{debug, warn};

use codeflow_core::{Job, JobId, JobState};
use codeflow_events::{Event, EventBus, InMemoryEventBus, JobEvent, Subscription};

use crate::artifacts::ArtifactStore;
use crate::jobs::registry::{JobRegistry, RegistryError};

/// Delivers job state changes to subscribers.
pub struct JobNotifier {
    bus: InMemoryEventBus<JobId, JobEvent>,
    registry: Arc<dyn JobRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl JobNotifier {
    pub fn new(registry: Arc<dyn JobRegistry>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            bus: InMemoryEventBus::new(),
            registry,
            artifacts,
        }
    }

    /// Publish a state change to every live stream of the job.
    ///
    /// Never blocks and never fails the caller. After a terminal event the
    /// job's topic is closed, so its streams end once drained.
    pub fn publish(&self, event: JobEvent) {
        let job_id = event.job_id;
        let event_type = event.event_type();
        let terminal = event.is_terminal();

        match self.bus.publish(&job_id, event) {
            Ok(delivered) => debug!(job_id = %job_id, event_type, delivered, "job event published"),
            Err(e) => warn!(job_id = %job_id, event_type, error = %e, "job event dropped"),
        }

        if terminal {
            self.bus.close(&job_id);
        }
    }

    /// Open an event stream for a job.
    ///
    /// The stream starts with the job's current state. For a job that already
    /// finished, that single terminal event is the whole stream.
    pub fn subscribe(&self, job_id: JobId) -> Result<JobEventStream, RegistryError> {
        let subscription = self.bus.subscribe(job_id);

        let job = match self.registry.get(job_id) {
            Ok(job) => job,
            Err(e) => {
                self.bus.close(&job_id);
                return Err(e);
            }
        };

        let snapshot = JobEvent::from_job(&job, self.result_content(&job));
        if snapshot.is_terminal() {
            // The worker may not have published yet; hand earlier streams the
            // outcome now so closing the topic cannot cut them short.
            self.publish(snapshot.clone());
            return Ok(JobEventStream::finished_with(snapshot));
        }

        Ok(JobEventStream {
            pending: Some(snapshot),
            subscription: Some(subscription),
            last: None,
        })
    }

    /// Number of live streams for a job.
    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.bus.subscriber_count(&job_id)
    }

    fn result_content(&self, job: &Job) -> Option<String> {
        let key = job.result_key.as_ref()?;
        match self.artifacts.get(key) {
            Ok(content) => Some(content),
            Err(e) => {
                warn!(job_id = %job.id, key = %key, error = %e, "result artifact unreadable");
                None
            }
        }
    }
}

impl core::fmt::Debug for JobNotifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobNotifier").finish_non_exhaustive()
    }
}

/// Outcome of a bounded wait on a [`JobEventStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPoll {
    Event(JobEvent),
    /// Nothing arrived within the timeout; the stream is still open.
    Timeout,
    /// The stream has ended.
    Closed,
}

/// Finite, ordered stream of events for one job.
///
/// Implements `Iterator` with blocking `next()`; use
/// [`JobEventStream::recv_timeout`] to interleave waiting with other checks.
#[derive(Debug)]
pub struct JobEventStream {
    pending: Option<JobEvent>,
    subscription: Option<Subscription<JobEvent>>,
    last: Option<JobState>,
}

impl JobEventStream {
    fn finished_with(event: JobEvent) -> Self {
        Self {
            pending: Some(event),
            subscription: None,
            last: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pending.is_none() && self.subscription.is_none()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&mut self, timeout: Duration) -> StreamPoll {
        if let Some(event) = self.pending.take() {
            return self.accept(event).map_or(StreamPoll::Closed, StreamPoll::Event);
        }

        loop {
            let Some(subscription) = &self.subscription else {
                return StreamPoll::Closed;
            };
            match subscription.recv_timeout(timeout) {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return StreamPoll::Event(event);
                    }
                }
                Err(RecvTimeoutError::Timeout) => return StreamPoll::Timeout,
                Err(RecvTimeoutError::Disconnected) => {
                    self.subscription = None;
                    return StreamPoll::Closed;
                }
            }
        }
    }

    /// Record `event` as yielded unless it is stale. Ends the stream after a
    /// terminal event.
    fn accept(&mut self, event: JobEvent) -> Option<JobEvent> {
        if self.last.is_some_and(|last| event.state <= last) {
            return None;
        }
        self.last = Some(event.state);
        if event.is_terminal() {
            self.subscription = None;
        }
        Some(event)
    }
}

impl Iterator for JobEventStream {
    type Item = JobEvent;

    fn next(&mut self) -> Option<JobEvent> {
        if let Some(event) = self.pending.take() {
            if let Some(event) = self.accept(event) {
                return Some(event);
            }
        }

        loop {
            let event = self.subscription.as_ref()?.recv().ok();
            match event {
                Some(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                None => {
                    self.subscription = None;
                    return None;
                }
            }
        }
    }
}
