//! Storage seam for jobs and the idempotency index.
//!
//! A persistent backend maps the two halves of [`JobStore`] onto two tables:
//! jobs keyed by id (with `created_at` indexed for FIFO scans and reaper
//! sweeps) and fingerprints keyed by their hash.

use std::collections::HashMap;

use tracing::trace;

use crate::{Fingerprint, Job, JobId, Status, StoreError};

/// Plain data access. Business rules live in [`JobManager`](crate::JobManager),
/// which is the only writer.
pub trait JobStore: Send + 'static {
    fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError>;

    /// Insert or replace.
    fn put(&mut self, job: Job) -> Result<(), StoreError>;

    /// All jobs in `status`, oldest `created_at` first.
    fn scan(&self, status: Status) -> Result<Vec<Job>, StoreError>;

    fn fingerprint_get(&self, fingerprint: &Fingerprint) -> Result<Option<JobId>, StoreError>;

    fn fingerprint_put(&mut self, fingerprint: Fingerprint, id: JobId) -> Result<(), StoreError>;

    fn fingerprint_remove(&mut self, fingerprint: &Fingerprint) -> Result<(), StoreError>;
}

/// Process-local store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: HashMap<JobId, Job>,
    // Insertion order, so jobs created within the same clock tick keep FIFO order.
    order: Vec<JobId>,
    fingerprints: HashMap<Fingerprint, JobId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl JobStore for MemoryStore {
    fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.get(id).cloned())
    }

    fn put(&mut self, job: Job) -> Result<(), StoreError> {
        let id = job.id;
        if self.jobs.insert(id, job).is_none() {
            self.order.push(id);
        }
        Ok(())
    }

    fn scan(&self, status: Status) -> Result<Vec<Job>, StoreError> {
        trace!("Scanning {} jobs", status);
        let mut jobs: Vec<Job> = self
            .order
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        // Stable, so ties keep insertion order.
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    fn fingerprint_get(&self, fingerprint: &Fingerprint) -> Result<Option<JobId>, StoreError> {
        Ok(self.fingerprints.get(fingerprint).copied())
    }

    fn fingerprint_put(&mut self, fingerprint: Fingerprint, id: JobId) -> Result<(), StoreError> {
        self.fingerprints.insert(fingerprint, id);
        Ok(())
    }

    fn fingerprint_remove(&mut self, fingerprint: &Fingerprint) -> Result<(), StoreError> {
        self.fingerprints.remove(fingerprint);
        Ok(())
    }
}
