use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::worker::{self, Analyzer, WorkMessage, WorkerConfig};
use crate::{
    reaper, Job, JobError, JobId, JobManager, JobRequest, JobStore, MemoryStore, QueueService,
    Status,
};

/// Upper bound on inputs per submission.
pub const MAX_INPUTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub reap_interval: Duration,
    pub stale_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            reap_interval: Duration::from_secs(30),
            stale_timeout: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), JobError> {
        let durations = [
            ("poll_interval", self.poll_interval),
            ("error_backoff", self.error_backoff),
            ("reap_interval", self.reap_interval),
            ("stale_timeout", self.stale_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(JobError::InvalidConfig(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.poll_interval,
            error_backoff: self.error_backoff,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: Status,
    pub progress: u8,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub is_existing: bool,
}

/// What a poller sees of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    pub status: Status,
    pub progress: u8,
    pub error: Option<String>,
    pub result: Option<Value>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        JobView {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            error: job.error,
            result: job.result,
        }
    }
}

/// Operations exposed to a transport layer.
///
/// Cloning is cheap; every clone talks to the same manager.
#[derive(Clone)]
pub struct JobService {
    manager: Arc<JobManager>,
    queue: QueueService,
}

impl JobService {
    pub fn new(store: impl JobStore) -> Self {
        let manager = Arc::new(JobManager::new(store));
        JobService {
            queue: QueueService::new(manager.clone()),
            manager,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    pub fn queue(&self) -> &QueueService {
        &self.queue
    }

    /// Create a job for the request, or return the live one for the same inputs.
    /// New jobs are enqueued.
    #[instrument(name = "service.submit", skip_all, fields(owner = %request.owner, inputs = request.inputs.len()))]
    pub async fn submit(&self, request: JobRequest) -> Result<SubmitResponse, JobError> {
        validate_request(&request)?;

        let (job_id, is_existing) = self.manager.create(request.inputs, request.owner).await?;
        let job = self
            .manager
            .get(&job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;

        if !is_existing && job.status == Status::Pending {
            self.queue.enqueue(&job_id).await?;
        }

        Ok(SubmitResponse {
            job_id,
            status: job.status,
            progress: job.progress,
            error: job.error,
            result: job.result,
            is_existing,
        })
    }

    pub async fn fetch(&self, job_id: &JobId) -> Result<JobView, JobError> {
        self.manager
            .get(job_id)
            .await?
            .map(JobView::from)
            .ok_or(JobError::NotFound(*job_id))
    }
}

fn validate_request(request: &JobRequest) -> Result<(), JobError> {
    if request.inputs.is_empty() {
        return Err(JobError::InvalidRequest("at least one input is required".into()));
    }
    if request.inputs.len() > MAX_INPUTS {
        return Err(JobError::InvalidRequest(format!(
            "at most {} inputs are allowed, got {}",
            MAX_INPUTS,
            request.inputs.len()
        )));
    }
    if request.inputs.iter().any(|input| input.trim().is_empty()) {
        return Err(JobError::InvalidRequest("inputs must not be blank".into()));
    }
    if request.owner.trim().is_empty() {
        return Err(JobError::InvalidRequest("owner must not be blank".into()));
    }
    Ok(())
}

#[derive(Debug)]
pub enum ClientRequest {
    Submit(JobRequest),
    Fetch(JobId),
}

#[derive(Debug)]
pub enum WorkResponseMessage {
    Submitted(SubmitResponse),
    Fetched(JobView),
    Rejected(JobError),
    JobStarted(JobId),
    JobCompleted(JobId),
    JobFailed(JobId, String),
}

impl From<WorkMessage> for WorkResponseMessage {
    fn from(msg: WorkMessage) -> Self {
        match msg {
            WorkMessage::JobStarted(id) => WorkResponseMessage::JobStarted(id),
            WorkMessage::JobCompleted(id) => WorkResponseMessage::JobCompleted(id),
            WorkMessage::JobFailed(id, error) => WorkResponseMessage::JobFailed(id, error),
        }
    }
}

/// Run the worker and the reaper, answer client requests and forward worker
/// events until cancelled.
pub async fn serve(
    cancel_token: CancellationToken,
    service: JobService,
    config: ServerConfig,
    analyzer: Arc<dyn Analyzer>,
    mut recv_from_client: mpsc::UnboundedReceiver<ClientRequest>,
    send_to_client: mpsc::UnboundedSender<WorkResponseMessage>,
) -> Result<(), Error> {
    config.validate()?;

    let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();

    let worker = {
        let cancel_token = cancel_token.clone();
        let queue = service.queue().clone();
        let worker_config = config.worker();
        tokio::spawn(
            async move {
                worker::start(cancel_token, queue, analyzer, worker_config, send_to_server).await;
            }
            .instrument(info_span!("worker")),
        )
    };

    let reaper = {
        let cancel_token = cancel_token.clone();
        let queue = service.queue().clone();
        tokio::spawn(
            async move {
                reaper::start(cancel_token, queue, config.reap_interval, config.stale_timeout)
                    .await;
            }
            .instrument(info_span!("reaper")),
        )
    };

    loop {
        tokio::select! {
            // Handle cancellation
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            // Handle events from the worker
            chan_msg = recv_from_worker.recv() => {
                let Some(msg) = chan_msg else {
                    debug!("Worker channel closed unexpectedly, exiting");
                    cancel_token.cancel();
                    break;
                };
                debug!(message = "Worker event", event = ?msg);
                if let Err(err) = send_to_client.send(msg.into()) {
                    error!(message = "Failed to send response to client", error = ?err);
                    cancel_token.cancel();
                    break;
                }
            },
            // Handle requests from clients
            chan_msg = recv_from_client.recv() => {
                let response = match chan_msg {
                    None => {
                        debug!("Client channel closed, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(ClientRequest::Submit(request)) => {
                        debug!(message = "Requested job", request = ?request);
                        match service.submit(request).await {
                            Ok(submitted) => WorkResponseMessage::Submitted(submitted),
                            Err(err) => WorkResponseMessage::Rejected(err),
                        }
                    },
                    Some(ClientRequest::Fetch(job_id)) => match service.fetch(&job_id).await {
                        Ok(view) => WorkResponseMessage::Fetched(view),
                        Err(err) => WorkResponseMessage::Rejected(err),
                    },
                };
                if let Err(err) = send_to_client.send(response) {
                    error!(message = "Failed to send response to client", error = ?err);
                    cancel_token.cancel();
                    break;
                }
            }
        }
    }

    // Wait for the worker and the reaper to wind down
    futures::future::join_all([worker, reaper])
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Server stopped.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(inputs: &[&str]) -> JobRequest {
        JobRequest {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            owner: "project-1".into(),
        }
    }

    #[tokio::test]
    async fn submit_creates_then_reuses() {
        let service = JobService::in_memory();

        let first = service.submit(request(&["a", "b"])).await.unwrap();
        assert!(!first.is_existing);
        assert_eq!(first.status, Status::Pending);
        assert_eq!(first.progress, 0);

        let second = service.submit(request(&["b", "a"])).await.unwrap();
        assert!(second.is_existing);
        assert_eq!(second.job_id, first.job_id);

        assert_eq!(service.queue().dequeue().await.unwrap(), Some(first.job_id));
    }

    #[tokio::test]
    async fn submit_rejects_bad_requests() {
        let service = JobService::in_memory();

        let empty = service.submit(request(&[])).await;
        assert!(matches!(empty, Err(JobError::InvalidRequest(_))));

        let too_many: Vec<String> = (0..=MAX_INPUTS).map(|i| i.to_string()).collect();
        let refs: Vec<&str> = too_many.iter().map(String::as_str).collect();
        assert!(matches!(
            service.submit(request(&refs)).await,
            Err(JobError::InvalidRequest(_))
        ));

        assert!(matches!(
            service.submit(request(&["ok", "  "])).await,
            Err(JobError::InvalidRequest(_))
        ));

        let no_owner = JobRequest {
            inputs: vec!["a".into()],
            owner: " ".into(),
        };
        assert!(matches!(
            service.submit(no_owner).await,
            Err(JobError::InvalidRequest(_))
        ));

        assert_eq!(service.queue().dequeue().await.unwrap(), None);
    }

    #[tokio::test]
    async fn fetch_unknown_job_is_not_found() {
        let service = JobService::in_memory();
        let id = uuid::Uuid::new_v4();
        match service.fetch(&id).await {
            Err(JobError::NotFound(missing)) => assert_eq!(missing, id),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn fetch_reports_progress_and_result() {
        let service = JobService::in_memory();
        let submitted = service.submit(request(&["x"])).await.unwrap();
        let manager = service.manager();
        manager
            .update(&submitted.job_id, crate::JobUpdate::processing(30))
            .await
            .unwrap();

        let view = service.fetch(&submitted.job_id).await.unwrap();
        assert_eq!(view.status, Status::Processing);
        assert_eq!(view.progress, 30);

        manager
            .update(&submitted.job_id, crate::JobUpdate::completed(json!([1, 2])))
            .await
            .unwrap();
        let view = service.fetch(&submitted.job_id).await.unwrap();
        assert_eq!(view.status, Status::Completed);
        assert_eq!(view.progress, 100);
        assert_eq!(view.result, Some(json!([1, 2])));
    }

    #[test]
    fn job_view_serializes_for_transport() {
        let view = JobView {
            job_id: uuid::Uuid::nil(),
            status: Status::Failed,
            progress: 10,
            error: Some(crate::TIMEOUT_EXCEEDED.into()),
            result: None,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(
            json,
            json!({
                "job_id": "00000000-0000-0000-0000-000000000000",
                "status": "FAILED",
                "progress": 10,
                "error": "TIMEOUT_EXCEEDED",
                "result": null,
            })
        );
    }

    #[test]
    fn zero_durations_are_rejected() {
        assert!(ServerConfig::default().validate().is_ok());
        let config = ServerConfig {
            stale_timeout: Duration::ZERO,
            ..ServerConfig::default()
        };
        match config.validate() {
            Err(JobError::InvalidConfig(msg)) => assert!(msg.contains("stale_timeout")),
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serve_answers_clients_and_forwards_worker_events() {
        let cancel_token = CancellationToken::new();
        let (send_to_server, recv_from_client) = mpsc::unbounded_channel();
        let (send_to_client, mut recv_from_server) = mpsc::unbounded_channel();
        let config = ServerConfig {
            poll_interval: Duration::from_millis(10),
            ..ServerConfig::default()
        };
        let analyzer: Arc<dyn Analyzer> =
            Arc::new(|inputs: &[String]| -> Result<Value, Error> { Ok(json!(inputs.join("+"))) });

        let server = tokio::spawn(serve(
            cancel_token.clone(),
            JobService::in_memory(),
            config,
            analyzer,
            recv_from_client,
            send_to_client,
        ));

        send_to_server
            .send(ClientRequest::Submit(request(&["a", "b"])))
            .unwrap();

        let mut job_id = None;
        let mut completed = false;
        while job_id.is_none() || !completed {
            match recv_from_server.recv().await.unwrap() {
                WorkResponseMessage::Submitted(submitted) => job_id = Some(submitted.job_id),
                WorkResponseMessage::JobCompleted(_) => completed = true,
                WorkResponseMessage::JobStarted(_) => {}
                other => panic!("unexpected message {:?}", other),
            }
        }
        let job_id = job_id.unwrap();

        send_to_server.send(ClientRequest::Fetch(job_id)).unwrap();
        match recv_from_server.recv().await.unwrap() {
            WorkResponseMessage::Fetched(view) => {
                assert_eq!(view.status, Status::Completed);
                assert_eq!(view.result, Some(json!("a+b")));
            }
            other => panic!("unexpected message {:?}", other),
        }

        send_to_server
            .send(ClientRequest::Fetch(uuid::Uuid::new_v4()))
            .unwrap();
        assert!(matches!(
            recv_from_server.recv().await.unwrap(),
            WorkResponseMessage::Rejected(JobError::NotFound(_))
        ));

        cancel_token.cancel();
        server.await.unwrap().unwrap();
    }
}
