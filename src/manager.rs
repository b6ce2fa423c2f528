//! Job creation, lookup and guarded mutation.

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::store::{JobStore, MemoryStore};
use crate::{state, Fingerprint, Job, JobError, JobId, Status, TIMEOUT_EXCEEDED};

/// A requested status change plus the fields that travel with it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub status: Status,
    pub progress: Option<u8>,
    pub error: Option<String>,
    pub result: Option<Value>,
}

impl JobUpdate {
    pub fn new(status: Status) -> Self {
        JobUpdate {
            status,
            progress: None,
            error: None,
            result: None,
        }
    }

    pub fn pending() -> Self {
        Self::new(Status::Pending)
    }

    pub fn processing(progress: u8) -> Self {
        Self::new(Status::Processing).with_progress(progress)
    }

    pub fn completed(result: Value) -> Self {
        JobUpdate {
            result: Some(result),
            ..Self::new(Status::Completed)
        }
    }

    /// Without [`with_progress`](Self::with_progress), the job keeps its last
    /// progress checkpoint (capped at 99) so pollers can see where it stopped.
    pub fn failed(error: impl Into<String>) -> Self {
        JobUpdate {
            error: Some(error.into()),
            ..Self::new(Status::Failed)
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Sole writer of job records and the idempotency index.
///
/// The store sits behind one lock, so index check-and-insert in [`create`](Self::create)
/// and validate-normalise-write in [`update`](Self::update) are atomic with respect
/// to each other. The lock is never held while a job is being analyzed.
pub struct JobManager {
    store: Mutex<Box<dyn JobStore>>,
}

impl Default for JobManager {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl JobManager {
    pub fn new(store: impl JobStore) -> Self {
        JobManager {
            store: Mutex::new(Box::new(store)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }

    /// Create a job for `inputs`, or return the live job already covering the same
    /// input set. The flag is `true` when an existing job was returned.
    #[instrument(name = "jobs.create", skip_all, fields(owner = %owner))]
    pub async fn create(
        &self,
        inputs: Vec<String>,
        owner: String,
    ) -> Result<(JobId, bool), JobError> {
        let fingerprint = Fingerprint::of(&inputs);
        let mut store = self.store.lock().await;

        if let Some(existing_id) = store.fingerprint_get(&fingerprint)? {
            match store.get(&existing_id)? {
                Some(existing) if existing.status != Status::Failed => {
                    debug!(job_id = %existing_id, status = %existing.status, "Returning existing job");
                    return Ok((existing_id, true));
                }
                _ => {
                    debug!(job_id = %existing_id, "Dropping stale fingerprint");
                    store.fingerprint_remove(&fingerprint)?;
                }
            }
        }

        let job = Job::new(inputs, owner);
        let job_id = job.id;
        store.put(job)?;
        store.fingerprint_put(fingerprint, job_id)?;
        debug!(job_id = %job_id, "Created job");

        Ok((job_id, false))
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<Job>, JobError> {
        Ok(self.store.lock().await.get(id)?)
    }

    /// Jobs in `status`, oldest first.
    pub async fn scan(&self, status: Status) -> Result<Vec<Job>, JobError> {
        Ok(self.store.lock().await.scan(status)?)
    }

    /// Apply `update` if the state machine allows it.
    ///
    /// Returns the job as stored afterwards, or `None` when the job is unknown or
    /// the update was dropped. Dropped updates leave the job untouched.
    #[instrument(name = "jobs.update", skip_all, fields(job_id = %id, next = %update.status))]
    pub async fn update(&self, id: &JobId, update: JobUpdate) -> Result<Option<Job>, JobError> {
        let mut store = self.store.lock().await;

        let Some(mut job) = store.get(id)? else {
            debug!("Update for unknown job ignored");
            return Ok(None);
        };

        if let Err(rejected) = state::validate(job.status, update.status) {
            warn!(current = %rejected.current, "Illegal transition blocked");
            return Ok(None);
        }

        let fingerprint = job.fingerprint();
        let resetting = job.status == Status::Failed && update.status == Status::Pending;

        if resetting {
            if let Some(holder) = store.fingerprint_get(&fingerprint)? {
                let held_by_live_job = holder != job.id
                    && store
                        .get(&holder)?
                        .map_or(false, |other| other.status != Status::Failed);
                if held_by_live_job {
                    warn!(holder = %holder, "Reset blocked, input set already has a live job");
                    return Ok(None);
                }
            }
        }

        // A late failure report must not hide that the reaper already timed the job out.
        let timed_out =
            job.status == Status::Failed && job.error.as_deref() == Some(TIMEOUT_EXCEEDED);

        let requested = update.progress.unwrap_or(job.progress);
        job.progress = match update.status {
            Status::Completed => 100,
            Status::Failed => requested.min(99),
            Status::Pending if resetting => 0,
            Status::Pending | Status::Processing => requested.max(job.progress).min(99),
        };
        job.status = update.status;

        match update.status {
            Status::Failed if !timed_out => {
                if let Some(error) = update.error {
                    job.error = Some(error);
                }
            }
            Status::Completed => {
                if let Some(result) = update.result {
                    job.result = Some(result);
                }
            }
            _ => {}
        }

        store.put(job.clone())?;

        if job.status == Status::Failed && store.fingerprint_get(&fingerprint)? == Some(job.id) {
            debug!("Released fingerprint");
            store.fingerprint_remove(&fingerprint)?;
        }
        if resetting {
            store.fingerprint_put(fingerprint, job.id)?;
        }

        Ok(Some(job))
    }
}
