//! Job status transition rules.
//!
//! ```text
//! PENDING ──► PROCESSING ──► COMPLETED
//!    ▲             │
//!    │             ▼
//!    └────────── FAILED
//! ```

use crate::{InvalidTransition, Status};

/// Statuses reachable from `from` in one step, excluding `from` itself.
pub fn allowed(from: Status) -> &'static [Status] {
    match from {
        Status::Pending => &[Status::Processing],
        Status::Processing => &[Status::Completed, Status::Failed],
        Status::Completed => &[],
        // Retry only.
        Status::Failed => &[Status::Pending],
    }
}

/// Check whether a job may move from `current` to `next`.
///
/// Same-state moves are accepted as no-ops.
pub fn validate(current: Status, next: Status) -> Result<(), InvalidTransition> {
    if current == next || allowed(current).contains(&next) {
        Ok(())
    } else {
        Err(InvalidTransition { current, next })
    }
}
