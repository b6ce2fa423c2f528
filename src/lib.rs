use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub mod error;
pub mod manager;
pub mod queue;
pub mod reaper;
pub mod server;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use error::{InvalidTransition, JobError, StoreError, TIMEOUT_EXCEEDED};
pub use manager::{JobManager, JobUpdate};
pub use queue::QueueService;
pub use server::{JobService, JobView, ServerConfig, SubmitResponse};
pub use store::{JobStore, MemoryStore};
pub use worker::Analyzer;

pub type JobId = Uuid;

/// What a caller asks to have analyzed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub inputs: Vec<String>,
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub inputs: Vec<String>,
    pub owner: String,
    pub status: Status,
    pub progress: u8,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub(crate) fn new(inputs: Vec<String>, owner: String) -> Self {
        Job {
            id: Uuid::new_v4(),
            inputs,
            owner,
            status: Status::Pending,
            progress: 0,
            error: None,
            result: None,
            created_at: Utc::now(),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.inputs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Pending,
        Status::Processing,
        Status::Completed,
        Status::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Processing => "PROCESSING",
            Status::Completed => "COMPLETED",
            Status::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order-independent identity of an input set, used for idempotent submission.
///
/// Inputs are sorted (duplicates are kept), joined with a NUL separator and
/// hashed with SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of<S: AsRef<str>>(inputs: &[S]) -> Self {
        let mut sorted: Vec<&str> = inputs.iter().map(AsRef::as_ref).collect();
        sorted.sort_unstable();

        let mut hasher = Sha256::new();
        for (i, input) in sorted.iter().enumerate() {
            if i > 0 {
                hasher.update([0u8]);
            }
            hasher.update(input.as_bytes());
        }
        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
