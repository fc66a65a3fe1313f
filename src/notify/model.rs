// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use crate::tasks::model::Priority;

/// Closed set of dispatchable event kinds — handling is exhaustive at
/// compile time, never a string comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyKind {
    TaskComplete,
    AgentError,
    Milestone,
}

impl NotifyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyKind::TaskComplete => "task_complete",
            NotifyKind::AgentError => "agent_error",
            NotifyKind::Milestone => "milestone",
        }
    }
}

impl std::fmt::Display for NotifyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event offered to the engine. Rate limiting keys on (agent_id, kind).
#[derive(Debug, Clone, Serialize)]
pub struct NotifyEvent {
    pub kind: NotifyKind,
    pub agent_id: String,
    pub title: String,
    pub body: String,
    pub priority: Priority,
}

impl NotifyEvent {
    pub fn task_complete(task_id: &str, title: &str, actor: &str) -> Self {
        Self {
            kind: NotifyKind::TaskComplete,
            agent_id: actor.to_string(),
            title: format!("Task {task_id} complete"),
            body: title.to_string(),
            priority: Priority::Medium,
        }
    }

    pub fn agent_error(agent_id: &str, message: &str) -> Self {
        Self {
            kind: NotifyKind::AgentError,
            agent_id: agent_id.to_string(),
            title: format!("Agent {agent_id} reported an error"),
            body: message.to_string(),
            priority: Priority::High,
        }
    }

    pub fn milestone(threshold: u8, completed: i64, total: i64) -> Self {
        Self {
            kind: NotifyKind::Milestone,
            agent_id: "progress".to_string(),
            title: format!("{threshold}% milestone reached"),
            body: format!("{completed}/{total} tasks complete"),
            priority: Priority::Medium,
        }
    }
}

/// Delivery payload handed to the sink.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub sound: bool,
}

/// What happened to an offered event. Never an error: drops are silent by
/// design, and sink failures are logged and swallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched,
    Suppressed(SuppressReason),
    SinkFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    Disabled,
    KindFiltered,
    BelowMinPriority,
    RateLimited,
}
