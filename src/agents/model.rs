use serde::{Deserialize, Serialize};

/// Agent availability states.
///
/// Blocked means the agent went dark mid-assignment (reaped by the janitor);
/// a fresh heartbeat revives it to Idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Blocked,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An autonomous worker. `tags` is a JSON array of specialization labels;
/// the counters feed the assignment suggestion scoring.
///
/// Invariant: `current_task` is set iff that task's `assigned_agent` points
/// back here and the task is InProgress. At most one agent holds a task.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub status: AgentStatus,
    pub current_task: Option<String>,
    pub tags: String,
    pub completed_count: i64,
    /// Running mean of actual/estimated duration over completed tasks that
    /// carried both numbers. None until the first data point.
    pub est_ratio_avg: Option<f64>,
    pub last_status_change: i64,
    pub last_heartbeat: Option<i64>,
    pub created_at: i64,
}

impl Agent {
    pub fn tag_list(&self) -> Vec<String> {
        serde_json::from_str(&self.tags).unwrap_or_default()
    }
}

/// One reaped (agent, task) pair from `reap_stale_assignments`.
#[derive(Debug, Clone, Serialize)]
pub struct StaleAssignment {
    pub agent_id: String,
    pub task_id: String,
}
