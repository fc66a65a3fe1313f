//! Pure lifecycle transition table.
//!
//! Deterministic — given the same (from, to) pair it always produces the same
//! answer, which keeps the storage layer's transactional `transition` easy to
//! reason about. Readiness, cancellation reasons, and criteria policy are
//! checked by the caller against live state; this table only answers whether
//! the edge exists at all.

use crate::error::{CoordError, CoordResult};
use crate::tasks::model::TaskStatus;

/// Validate a lifecycle edge.
///
/// Pending → InProgress → {Review, Completed}; Review → {InProgress,
/// Completed}; Blocked → InProgress (resume); any non-terminal → Blocked;
/// any non-terminal → Cancelled. Completed and Cancelled are terminal.
pub fn validate(from: TaskStatus, to: TaskStatus) -> CoordResult<()> {
    use TaskStatus::*;

    if from.is_terminal() {
        return Err(CoordError::Validation(format!(
            "invalid transition: {from} is terminal"
        )));
    }
    if from == to {
        return Err(CoordError::Validation(format!(
            "invalid transition: task is already {to}"
        )));
    }

    let ok = match to {
        InProgress => matches!(from, Pending | Blocked | Review),
        Review => from == InProgress,
        Completed => matches!(from, InProgress | Review),
        // Any non-terminal state can be parked or abandoned.
        Blocked | Cancelled => true,
        Pending => false,
    };

    if ok {
        Ok(())
    } else {
        Err(CoordError::Validation(format!(
            "invalid transition: {from} -> {to}"
        )))
    }
}

/// True when entering `to` from `from` requires the readiness check
/// (all `requires` prerequisites Completed or Cancelled).
pub fn needs_readiness(from: TaskStatus, to: TaskStatus) -> bool {
    to == TaskStatus::InProgress && matches!(from, TaskStatus::Pending | TaskStatus::Blocked)
}
