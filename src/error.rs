//! Typed error taxonomy for every coordination operation.
//!
//! The core never panics on a domain error and never aborts the process;
//! each operation returns `CoordResult<T>`. Only [`CoordError::StoreUnavailable`]
//! and [`CoordError::SinkUnavailable`] are transient — callers may retry those
//! with backoff. Everything else is a definitive answer.

/// Errors returned by the coordination core.
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    /// Malformed input — empty cancellation reason, blank title, duplicate
    /// edge, transition not in the lifecycle table, and similar.
    #[error("validation: {0}")]
    Validation(String),

    /// Inserting the edge would close a cycle. The edge set is unchanged.
    #[error("dependency cycle: {depends_on} already reaches {task}")]
    CycleDetected { task: String, depends_on: String },

    /// The task has unfinished `requires` prerequisites.
    #[error("task {0} is not ready: unfinished prerequisites")]
    NotReady(String),

    /// The agent already holds a different active task.
    #[error("agent {agent} already holds task {task}")]
    AgentBusy { agent: String, task: String },

    /// The task is already held by another agent (also what the loser of a
    /// claim race receives).
    #[error("task {task} is already assigned to agent {agent}")]
    AlreadyAssigned { task: String, agent: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Transient store failure (query timeout, connection loss). Retryable.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Fuzzy evidence matching produced more than one candidate above the
    /// similarity threshold. Recorded as a conflict for manual resolution,
    /// never auto-applied.
    #[error("ambiguous evidence match for {evidence}: candidates {candidates:?}")]
    AmbiguousMatch {
        evidence: String,
        candidates: Vec<String>,
    },

    /// Notification delivery failed. Only ever surfaced by a sink
    /// implementation — the engine logs and swallows it, so task operations
    /// never see this variant.
    #[error("notification sink unavailable: {0}")]
    SinkUnavailable(String),
}

impl CoordError {
    /// Shorthand for the common lookup-miss cases.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True for transient errors that callers may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordError::StoreUnavailable(_) | CoordError::SinkUnavailable(_)
        )
    }
}

impl From<sqlx::Error> for CoordError {
    fn from(e: sqlx::Error) -> Self {
        CoordError::StoreUnavailable(e.to_string())
    }
}

pub type CoordResult<T> = Result<T, CoordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_and_sink_are_retryable() {
        assert!(CoordError::StoreUnavailable("timeout".into()).is_retryable());
        assert!(CoordError::SinkUnavailable("gone".into()).is_retryable());
        assert!(!CoordError::NotReady("T-1".into()).is_retryable());
        assert!(!CoordError::Validation("bad".into()).is_retryable());
    }

    #[test]
    fn test_sqlx_errors_map_to_store_unavailable() {
        let err: CoordError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, CoordError::StoreUnavailable(_)));
    }
}
