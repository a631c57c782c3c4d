//! Job registry: the single owner of canonical job records.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;

use codeflow_core::{ArtifactKey, DomainError, Job, JobId, JobState, Transition};

/// Job registry abstraction.
///
/// Workers and the dispatcher only hold job ids; every state change goes
/// through [`JobRegistry::transition`].
pub trait JobRegistry: Send + Sync {
    /// Allocate a fresh id and insert a `Pending` record for it.
    fn create(&self) -> Result<JobId, RegistryError>;

    /// Move a job one step forward, storing the transition payload with it.
    ///
    /// Returns the record as it is after the transition.
    fn transition(&self, id: JobId, transition: Transition) -> Result<Job, RegistryError>;

    /// Snapshot of a job.
    fn get(&self, id: JobId) -> Result<Job, RegistryError>;

    /// Remove a `Pending` job whose submission was rejected before it reached
    /// the queue.
    fn discard(&self, id: JobId) -> Result<(), RegistryError>;

    /// Jobs ordered by creation time, optionally filtered by state.
    fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, RegistryError>;

    fn stats(&self) -> Result<RegistryStats, RegistryError>;

    /// Drop terminal records that finished more than `older_than` ago.
    /// Returns how many records were removed.
    fn purge_finished(&self, older_than: Duration) -> Result<usize, RegistryError>;
}

/// Registry error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },
    #[error("job {id} cannot be discarded in state {state}")]
    NotDiscardable { id: JobId, state: JobState },
    #[error(transparent)]
    Domain(DomainError),
    #[error("registry lock poisoned")]
    Poisoned,
}

impl From<DomainError> for RegistryError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::InvalidTransition { id, from, to } => {
                RegistryError::InvalidTransition { id, from, to }
            }
            other => RegistryError::Domain(other),
        }
    }
}

/// Job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl RegistryStats {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.succeeded + self.failed
    }
}

type Slot = Arc<Mutex<Job>>;

/// In-process registry.
///
/// The id map sits behind an `RwLock` that is only write-locked to insert or
/// remove records; each record has its own `Mutex`, so a transition on one
/// job never waits on work for another.
#[derive(Debug, Default)]
pub struct InMemoryJobRegistry {
    jobs: RwLock<HashMap<JobId, Slot>>,
}

impl InMemoryJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn slot(&self, id: JobId) -> Result<Slot, RegistryError> {
        let jobs = self.jobs.read().map_err(|_| RegistryError::Poisoned)?;
        jobs.get(&id).cloned().ok_or(RegistryError::NotFound(id))
    }

    fn snapshot_all(&self) -> Result<Vec<Job>, RegistryError> {
        let slots: Vec<Slot> = {
            let jobs = self.jobs.read().map_err(|_| RegistryError::Poisoned)?;
            jobs.values().cloned().collect()
        };
        slots
            .iter()
            .map(|slot| slot.lock().map(|j| j.clone()).map_err(|_| RegistryError::Poisoned))
            .collect()
    }
}

impl JobRegistry for InMemoryJobRegistry {
    fn create(&self) -> Result<JobId, RegistryError> {
        let mut jobs = self.jobs.write().map_err(|_| RegistryError::Poisoned)?;
        let id = loop {
            let candidate = JobId::new();
            if !jobs.contains_key(&candidate) {
                break candidate;
            }
        };
        let job = Job::new(id, ArtifactKey::submission(id));
        jobs.insert(id, Arc::new(Mutex::new(job)));
        Ok(id)
    }

    fn transition(&self, id: JobId, transition: Transition) -> Result<Job, RegistryError> {
        let slot = self.slot(id)?;
        let mut job = slot.lock().map_err(|_| RegistryError::Poisoned)?;
        job.apply(transition)?;
        Ok(job.clone())
    }

    fn get(&self, id: JobId) -> Result<Job, RegistryError> {
        let slot = self.slot(id)?;
        let job = slot.lock().map_err(|_| RegistryError::Poisoned)?;
        Ok(job.clone())
    }

    fn discard(&self, id: JobId) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.write().map_err(|_| RegistryError::Poisoned)?;
        let slot = jobs.get(&id).ok_or(RegistryError::NotFound(id))?;
        let state = slot.lock().map_err(|_| RegistryError::Poisoned)?.state;
        if state != JobState::Pending {
            return Err(RegistryError::NotDiscardable { id, state });
        }
        jobs.remove(&id);
        Ok(())
    }

    fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, RegistryError> {
        let mut result: Vec<Job> = self
            .snapshot_all()?
            .into_iter()
            .filter(|j| state.is_none_or(|s| j.state == s))
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    fn stats(&self) -> Result<RegistryStats, RegistryError> {
        let mut stats = RegistryStats::default();
        for job in self.snapshot_all()? {
            match job.state {
                JobState::Pending => stats.pending += 1,
                JobState::Running => stats.running += 1,
                JobState::Succeeded => stats.succeeded += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    fn purge_finished(&self, older_than: Duration) -> Result<usize, RegistryError> {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };
        let mut jobs = self.jobs.write().map_err(|_| RegistryError::Poisoned)?;
        let before = jobs.len();

        jobs.retain(|_, slot| match slot.lock() {
            Ok(job) => !(job.is_terminal() && job.finished_at.is_some_and(|at| at <= cutoff)),
            Err(_) => true,
        });

        Ok(before - jobs.len())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use super::*;
    use codeflow_core::StageFailure;

    fn run_to_success(registry: &InMemoryJobRegistry, id: JobId) -> Job {
        registry.transition(id, Transition::Start).unwrap();
        registry
            .transition(
                id,
                Transition::Succeed {
                    result_key: ArtifactKey::stage_output(id, 1, "out"),
                },
            )
            .unwrap()
    }

    #[test]
    fn create_inserts_pending_record() {
        let registry = InMemoryJobRegistry::new();
        let id = registry.create().unwrap();

        let job = registry.get(id).unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.submission_key, ArtifactKey::submission(id));
    }

    #[test]
    fn unknown_id_is_not_found() {
        let registry = InMemoryJobRegistry::new();
        let id = JobId::new();

        assert_eq!(registry.get(id), Err(RegistryError::NotFound(id)));
        assert_eq!(
            registry.transition(id, Transition::Start),
            Err(RegistryError::NotFound(id))
        );
    }

    #[test]
    fn transition_after_terminal_is_rejected_and_state_kept() {
        let registry = InMemoryJobRegistry::new();
        let id = registry.create().unwrap();
        let done = run_to_success(&registry, id);

        let err = registry
            .transition(
                id,
                Transition::Succeed {
                    result_key: ArtifactKey::new("other"),
                },
            )
            .unwrap_err();

        assert_eq!(
            err,
            RegistryError::InvalidTransition {
                id,
                from: JobState::Succeeded,
                to: JobState::Succeeded,
            }
        );
        assert_eq!(registry.get(id).unwrap(), done);
    }

    #[test]
    fn skipping_running_is_rejected() {
        let registry = InMemoryJobRegistry::new();
        let id = registry.create().unwrap();

        let err = registry
            .transition(
                id,
                Transition::Fail {
                    error: StageFailure::new(1, "api", "boom"),
                },
            )
            .unwrap_err();

        assert!(matches!(err, RegistryError::InvalidTransition { from: JobState::Pending, .. }));
        assert_eq!(registry.get(id).unwrap().state, JobState::Pending);
    }

    #[test]
    fn concurrent_creates_yield_distinct_ids() {
        let registry = InMemoryJobRegistry::arc();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || (0..250).map(|_| registry.create().unwrap()).collect::<Vec<_>>())
            })
            .collect();

        let mut ids = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(ids.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(ids.len(), 2000);
        assert_eq!(registry.stats().unwrap().pending, 2000);
    }

    #[test]
    fn discard_only_applies_to_pending_jobs() {
        let registry = InMemoryJobRegistry::new();
        let pending = registry.create().unwrap();
        let running = registry.create().unwrap();
        registry.transition(running, Transition::Start).unwrap();

        registry.discard(pending).unwrap();
        assert_eq!(registry.get(pending), Err(RegistryError::NotFound(pending)));

        assert_eq!(
            registry.discard(running),
            Err(RegistryError::NotDiscardable {
                id: running,
                state: JobState::Running,
            })
        );
    }

    #[test]
    fn stats_and_list_follow_states() {
        let registry = InMemoryJobRegistry::new();
        let ids: Vec<_> = (0..4).map(|_| registry.create().unwrap()).collect();
        registry.transition(ids[0], Transition::Start).unwrap();
        run_to_success(&registry, ids[1]);

        let stats = registry.stats().unwrap();
        assert_eq!(
            stats,
            RegistryStats {
                pending: 2,
                running: 1,
                succeeded: 1,
                failed: 0,
            }
        );
        assert_eq!(stats.total(), 4);

        let pending = registry.list(Some(JobState::Pending), 10).unwrap();
        assert_eq!(pending.iter().map(|j| j.id).collect::<Vec<_>>(), vec![ids[2], ids[3]]);
        assert_eq!(registry.list(None, 3).unwrap().len(), 3);
    }

    #[test]
    fn purge_removes_only_old_terminal_records() {
        let registry = InMemoryJobRegistry::new();
        let finished = registry.create().unwrap();
        let waiting = registry.create().unwrap();
        run_to_success(&registry, finished);

        assert_eq!(registry.purge_finished(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(registry.purge_finished(Duration::ZERO).unwrap(), 1);

        assert_eq!(registry.get(finished), Err(RegistryError::NotFound(finished)));
        assert!(registry.get(waiting).is_ok());
    }
}
