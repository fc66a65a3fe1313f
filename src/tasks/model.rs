use serde::{Deserialize, Serialize};

// ─── Status ──────────────────────────────────────────────────────────────────

/// The finite set of states a task can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Review,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Review => "review",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Completed and Cancelled admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Priority ────────────────────────────────────────────────────────────────

/// Task/event priority. Variant order is the comparison order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Task ────────────────────────────────────────────────────────────────────

/// A trackable unit of work. `tags` is a JSON array of skill labels.
///
/// Invariants (enforced by `TaskStore`):
/// - `completed_at` is set iff `status == Completed`
/// - `assigned_agent` is set iff an agent's `current_task` points back here
///   and the status is InProgress
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub epic: Option<String>,
    pub parent_id: Option<String>,
    pub assigned_agent: Option<String>,
    pub tags: String,
    pub estimated_minutes: Option<i64>,
    pub actual_minutes: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl Task {
    pub fn tag_list(&self) -> Vec<String> {
        serde_json::from_str(&self.tags).unwrap_or_default()
    }
}

/// Input for task creation. Ids are caller-supplied stable strings; the
/// `T-NNN` convention keeps them recoverable from evidence text.
#[derive(Debug, Clone)]
pub struct TaskDraft {
    pub id: String,
    pub title: String,
    pub priority: Priority,
    pub epic: Option<String>,
    pub parent_id: Option<String>,
    pub tags: Vec<String>,
    pub estimated_minutes: Option<i64>,
}

impl TaskDraft {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            priority: Priority::Medium,
            epic: None,
            parent_id: None,
            tags: Vec::new(),
            estimated_minutes: None,
        }
    }
}

// ─── Audit ───────────────────────────────────────────────────────────────────

/// One immutable audit entry. Appended in the same transaction as the
/// mutation it records; this trail is the only side-effect channel. The id
/// is the append sequence, so ordering by it replays history faithfully.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub task_id: String,
    pub actor: String,
    pub from_status: Option<String>,
    pub to_status: String,
    pub message: Option<String>,
    pub evidence_ref: Option<String>,
    pub created_at: i64,
}

// ─── Progress ────────────────────────────────────────────────────────────────

/// Counts by status across the whole task set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressSummary {
    pub total: i64,
    pub pending: i64,
    pub in_progress: i64,
    pub blocked: i64,
    pub review: i64,
    pub completed: i64,
    pub cancelled: i64,
}

impl ProgressSummary {
    /// Overall completion percentage (`completed / total * 100`), 0 when empty.
    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.completed as f64 / self.total as f64 * 100.0
        }
    }
}
