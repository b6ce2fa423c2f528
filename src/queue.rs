//! FIFO view over pending jobs.
//!
//! There is no separate queue storage: a job is queued while its status is
//! `PENDING`, and leaves the queue when a worker moves it on through the
//! [`JobManager`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, trace};

use crate::{JobError, JobId, JobManager, JobUpdate, Status, TIMEOUT_EXCEEDED};

#[derive(Clone)]
pub struct QueueService {
    manager: Arc<JobManager>,
}

impl QueueService {
    pub fn new(manager: Arc<JobManager>) -> Self {
        QueueService { manager }
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    /// Make sure the job is `PENDING`. A no-op for jobs that already are.
    pub async fn enqueue(&self, id: &JobId) -> Result<(), JobError> {
        self.manager.update(id, JobUpdate::pending()).await?;
        Ok(())
    }

    /// Oldest pending job, if any.
    ///
    /// Only observes: the caller must claim the job by moving it to `PROCESSING`.
    /// Two concurrent callers can see the same job, so this is only safe with a
    /// single consumer.
    pub async fn dequeue(&self) -> Result<Option<JobId>, JobError> {
        let pending = self.manager.scan(Status::Pending).await?;
        Ok(pending.first().map(|job| job.id))
    }

    /// Reaching a terminal status is the acknowledgement, so there is nothing to do.
    pub async fn ack(&self, id: &JobId) {
        trace!(job_id = %id, "Acknowledged");
    }

    /// Put the job back in the queue.
    pub async fn nack(&self, id: &JobId) -> Result<(), JobError> {
        debug!(job_id = %id, "Requeueing job");
        self.manager.update(id, JobUpdate::pending()).await?;
        Ok(())
    }

    /// Fail every `PROCESSING` job older than `timeout` with [`TIMEOUT_EXCEEDED`].
    pub async fn reap_stale(&self, timeout: Duration) -> Result<usize, JobError> {
        self.reap_stale_at(timeout, Utc::now()).await
    }

    /// [`reap_stale`](Self::reap_stale) against an explicit clock.
    ///
    /// Age is measured from `created_at`. Only jobs whose failure was actually
    /// applied are counted, so a job that finished in the meantime is skipped.
    #[instrument(name = "queue.reap_stale", skip(self))]
    pub async fn reap_stale_at(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, JobError> {
        let mut reaped = 0;

        for job in self.manager.scan(Status::Processing).await? {
            let stale = (now - job.created_at)
                .to_std()
                .map_or(false, |age| age > timeout);
            if !stale {
                continue;
            }

            info!(job_id = %job.id, created_at = %job.created_at, "Reaping stuck job");
            let failed = self
                .manager
                .update(&job.id, JobUpdate::failed(TIMEOUT_EXCEEDED))
                .await?;
            if failed.is_some() {
                reaped += 1;
            }
        }

        Ok(reaped)
    }
}
