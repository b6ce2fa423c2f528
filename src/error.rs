//! Error types for the job lifecycle.

use thiserror::Error;

use crate::{JobId, Status};

/// Error code the reaper attaches to jobs whose worker never reported back.
pub const TIMEOUT_EXCEEDED: &str = "TIMEOUT_EXCEEDED";

/// Errors visible to callers of the job service.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by a [`JobStore`](crate::JobStore) backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A status change the state machine does not allow.
///
/// Never surfaced to callers; the job manager logs it and drops the update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition from {current} to {next}")]
pub struct InvalidTransition {
    pub current: Status,
    pub next: Status,
}
