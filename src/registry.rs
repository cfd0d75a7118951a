//! Lookup table of active and recent jobs.
//!
//! The registry holds shared handles used for lookup and control only; the
//! job's own background task is the sole writer of its history.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::job::Job;
use crate::types::JobId;

pub trait JobRegistry: Send + Sync {
    fn insert(&self, job: Arc<Job>);

    fn get(&self, id: &JobId) -> Option<Arc<Job>>;

    fn remove(&self, id: &JobId) -> Option<Arc<Job>>;

    /// All jobs, oldest first.
    fn list(&self) -> Vec<Arc<Job>>;

    /// Drop jobs that finished at least `older_than` ago. Returns how many went.
    fn prune_finished(&self, older_than: Duration) -> usize {
        let expired: Vec<JobId> = self
            .list()
            .iter()
            .filter(|job| job.finished_for().is_some_and(|age| age >= older_than))
            .map(|job| job.id())
            .collect();
        expired.iter().filter(|id| self.remove(id).is_some()).count()
    }
}

/// Process-memory registry.
#[derive(Default)]
pub struct InMemoryJobRegistry {
    jobs: RwLock<HashMap<JobId, Arc<Job>>>,
}

impl InMemoryJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobRegistry for InMemoryJobRegistry {
    fn insert(&self, job: Arc<Job>) {
        self.jobs.write().insert(job.id(), job);
    }

    fn get(&self, id: &JobId) -> Option<Arc<Job>> {
        self.jobs.read().get(id).cloned()
    }

    fn remove(&self, id: &JobId) -> Option<Arc<Job>> {
        self.jobs.write().remove(id)
    }

    fn list(&self) -> Vec<Arc<Job>> {
        let mut jobs: Vec<Arc<Job>> = self.jobs.read().values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at());
        jobs
    }
}
