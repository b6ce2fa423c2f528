use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Error};
use serde_json::Value;
use tokio::{sync::mpsc::UnboundedSender, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::{JobError, JobId, JobUpdate, QueueService};

/// Progress reported once a job has been claimed and handed to the analyzer.
pub const CLAIM_CHECKPOINT: u8 = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkMessage {
    JobStarted(JobId),
    JobCompleted(JobId),
    JobFailed(JobId, String),
}

/// The analysis engine a worker hands job inputs to.
///
/// Runs on the blocking thread pool, so it may take as long as it needs. Any
/// error fails the job with the error's message.
pub trait Analyzer: Send + Sync + 'static {
    fn compute(&self, inputs: &[String]) -> Result<Value, Error>;
}

impl<F> Analyzer for F
where
    F: Fn(&[String]) -> Result<Value, Error> + Send + Sync + 'static,
{
    fn compute(&self, inputs: &[String]) -> Result<Value, Error> {
        self(inputs)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls while the queue is empty.
    pub poll_interval: Duration,
    /// Sleep after the store could not be read.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Consume the queue one job at a time until cancelled.
///
/// A failing job never stops the loop; a failing store is retried after
/// `error_backoff`.
pub async fn start(
    cancel_token: CancellationToken,
    queue: QueueService,
    analyzer: Arc<dyn Analyzer>,
    config: WorkerConfig,
    send_to_server: UnboundedSender<WorkMessage>,
) {
    loop {
        let next = tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            next = queue.dequeue() => next,
        };

        let period = match next {
            Ok(None) => config.poll_interval,
            Ok(Some(job_id)) => {
                match process(&cancel_token, &queue, &analyzer, job_id, &send_to_server).await {
                    Ok(Flow::Continue) => continue,
                    Ok(Flow::Stop) => break,
                    Err(err) => {
                        error!(message = "Error processing job", job_id = %job_id, error = %err);
                        config.error_backoff
                    }
                }
            }
            Err(err) => {
                error!(message = "Error reading queue", error = %err);
                config.error_backoff
            }
        };

        if !pause(&cancel_token, period).await {
            debug!("Worker Cancelled");
            break;
        }
    }
    info!("Worker stopped.");
}

/// Sleep for `period`, returning `false` if cancelled first.
async fn pause(cancel_token: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        _ = cancel_token.cancelled() => false,
        _ = sleep(period) => true,
    }
}

fn notify(send_to_server: &UnboundedSender<WorkMessage>, msg: WorkMessage) {
    if let Err(err) = send_to_server.send(msg) {
        debug!(message = "No one listening for worker events", event = ?err.0);
    }
}

#[instrument(skip_all, fields(job_id = %job_id))]
async fn process(
    cancel_token: &CancellationToken,
    queue: &QueueService,
    analyzer: &Arc<dyn Analyzer>,
    job_id: JobId,
    send_to_server: &UnboundedSender<WorkMessage>,
) -> Result<Flow, JobError> {
    let manager = queue.manager();

    let Some(job) = manager.get(&job_id).await? else {
        warn!("Job not found in store, skipping");
        return Ok(Flow::Continue);
    };

    if manager.update(&job_id, JobUpdate::processing(0)).await?.is_none() {
        debug!("Job was claimed elsewhere, skipping");
        return Ok(Flow::Continue);
    }
    debug!("Processing job");
    notify(send_to_server, WorkMessage::JobStarted(job_id));
    manager
        .update(&job_id, JobUpdate::processing(CLAIM_CHECKPOINT))
        .await?;

    let analysis = {
        let analyzer = analyzer.clone();
        let inputs = job.inputs;
        tokio::task::spawn_blocking(move || analyzer.compute(&inputs))
    };

    let outcome = tokio::select! {
        _ = cancel_token.cancelled() => {
            warn!("Shutting down mid-analysis, job is left for the reaper");
            return Ok(Flow::Stop);
        },
        joined = analysis => match joined {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => Err(anyhow!("analysis panicked")),
            Err(err) => Err(anyhow!("analysis aborted: {}", err)),
        },
    };

    match outcome {
        Ok(result) => {
            if manager
                .update(&job_id, JobUpdate::completed(result))
                .await?
                .is_some()
            {
                info!("Job completed");
                notify(send_to_server, WorkMessage::JobCompleted(job_id));
            } else {
                warn!("Completion dropped, job already left PROCESSING");
            }
        }
        Err(err) => {
            let msg = err.to_string();
            warn!(error = %msg, "Job failed");
            if manager
                .update(&job_id, JobUpdate::failed(msg.clone()))
                .await?
                .is_some()
            {
                notify(send_to_server, WorkMessage::JobFailed(job_id, msg));
            }
        }
    }

    queue.ack(&job_id).await;
    Ok(Flow::Continue)
}
