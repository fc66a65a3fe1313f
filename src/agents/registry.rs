// agents/registry.rs — agent lifecycle and atomic task assignment.
//
// `sync` is the claim path: assign task + agent.status=Working + task →
// InProgress as one transaction. Conditional UPDATEs guarded by
// `rows_affected` make the loser of a racing claim fail with a typed
// conflict, never with silent corruption.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::agents::model::{Agent, StaleAssignment};
use crate::agents::suggest::{self, SuggestedAgent};
use crate::error::{CoordError, CoordResult};
use crate::graph::storage::requires_satisfied;
use crate::storage::{now_ts, Storage};
use crate::tasks::model::{Task, TaskStatus};
use crate::tasks::storage::append_audit;

/// Updated (agent, task) pair after a successful `sync`.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub agent: Agent,
    pub task: Task,
}

#[derive(Clone)]
pub struct AgentRegistry {
    storage: Arc<Storage>,
}

impl AgentRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    // ─── CRUD ─────────────────────────────────────────────────────────────────

    pub async fn create(&self, id: &str, name: &str, tags: &[String]) -> CoordResult<Agent> {
        if id.trim().is_empty() || name.trim().is_empty() {
            return Err(CoordError::Validation(
                "agent id and name must not be empty".into(),
            ));
        }
        let now = now_ts();
        let tags_json = serde_json::to_string(tags)
            .map_err(|e| CoordError::Validation(format!("unserializable tags: {e}")))?;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO agents
             (id, name, status, tags, last_status_change, created_at)
             VALUES (?, ?, 'idle', ?, ?, ?)",
        )
        .bind(id)
        .bind(name.trim())
        .bind(&tags_json)
        .bind(now)
        .bind(now)
        .execute(&self.storage.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoordError::Validation(format!("agent id {id} already exists")));
        }
        self.require(id).await
    }

    pub async fn get(&self, id: &str) -> CoordResult<Option<Agent>> {
        Ok(sqlx::query_as("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.storage.pool())
            .await?)
    }

    pub async fn require(&self, id: &str) -> CoordResult<Agent> {
        self.get(id)
            .await?
            .ok_or_else(|| CoordError::not_found("agent", id))
    }

    pub async fn list(&self) -> CoordResult<Vec<Agent>> {
        Ok(sqlx::query_as("SELECT * FROM agents ORDER BY id ASC")
            .fetch_all(&self.storage.pool())
            .await?)
    }

    // ─── Sync / release ───────────────────────────────────────────────────────

    /// Atomically hand `task_id` to `agent_id`.
    ///
    /// Accepts a Pending task that is Ready (normal claim, transitions it to
    /// InProgress) or an InProgress task nobody holds (pickup after a
    /// `release`). Re-syncing an existing pairing is idempotent.
    pub async fn sync(&self, agent_id: &str, task_id: &str) -> CoordResult<SyncOutcome> {
        self.storage
            .with_timeout(self.sync_tx(agent_id, task_id))
            .await
    }

    async fn sync_tx(&self, agent_id: &str, task_id: &str) -> CoordResult<SyncOutcome> {
        let mut tx = self.storage.pool().begin().await?;

        let agent: Agent = sqlx::query_as("SELECT * FROM agents WHERE id = ?")
            .bind(agent_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoordError::not_found("agent", agent_id))?;
        let task: Task = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoordError::not_found("task", task_id))?;

        if agent.current_task.as_deref() == Some(task_id)
            && task.assigned_agent.as_deref() == Some(agent_id)
        {
            drop(tx);
            return Ok(SyncOutcome { agent, task });
        }
        if let Some(holder) = task.assigned_agent.as_deref() {
            if holder != agent_id {
                return Err(CoordError::AlreadyAssigned {
                    task: task_id.to_string(),
                    agent: holder.to_string(),
                });
            }
        }
        if let Some(held) = agent.current_task.as_deref() {
            if held != task_id {
                return Err(CoordError::AgentBusy {
                    agent: agent_id.to_string(),
                    task: held.to_string(),
                });
            }
        }

        let now = now_ts();
        match task.status {
            TaskStatus::Pending => {
                if !requires_satisfied(&mut tx, task_id).await? {
                    return Err(CoordError::NotReady(task_id.to_string()));
                }
                let rows = sqlx::query(
                    "UPDATE tasks SET status = 'in_progress', assigned_agent = ?, updated_at = ?
                     WHERE id = ? AND status = 'pending' AND assigned_agent IS NULL",
                )
                .bind(agent_id)
                .bind(now)
                .bind(task_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if rows == 0 {
                    return Err(self.lost_claim(&mut tx, task_id).await);
                }
                append_audit(
                    &mut tx,
                    task_id,
                    agent_id,
                    Some("pending"),
                    "in_progress",
                    Some(&format!("assigned to {agent_id}")),
                    None,
                )
                .await?;
            }
            // Pickup of a task left InProgress by `release`. No second
            // Pending→InProgress transition; only the assignment changes.
            TaskStatus::InProgress => {
                let rows = sqlx::query(
                    "UPDATE tasks SET assigned_agent = ?, updated_at = ?
                     WHERE id = ? AND status = 'in_progress' AND assigned_agent IS NULL",
                )
                .bind(agent_id)
                .bind(now)
                .bind(task_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if rows == 0 {
                    return Err(self.lost_claim(&mut tx, task_id).await);
                }
                append_audit(
                    &mut tx,
                    task_id,
                    agent_id,
                    Some("in_progress"),
                    "in_progress",
                    Some(&format!("reassigned to {agent_id}")),
                    None,
                )
                .await?;
            }
            _ => return Err(CoordError::NotReady(task_id.to_string())),
        }

        let rows = sqlx::query(
            "UPDATE agents
             SET status = 'working', current_task = ?, last_status_change = ?, last_heartbeat = ?
             WHERE id = ? AND current_task IS NULL",
        )
        .bind(task_id)
        .bind(now)
        .bind(now)
        .bind(agent_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if rows == 0 {
            let held: Option<String> =
                sqlx::query_scalar("SELECT current_task FROM agents WHERE id = ?")
                    .bind(agent_id)
                    .fetch_one(&mut *tx)
                    .await
                    .unwrap_or(None);
            return Err(CoordError::AgentBusy {
                agent: agent_id.to_string(),
                task: held.unwrap_or_default(),
            });
        }

        tx.commit().await?;
        info!(agent = %agent_id, task_id = %task_id, "agent synced to task");

        Ok(SyncOutcome {
            agent: self.require(agent_id).await?,
            task: sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
                .bind(task_id)
                .fetch_one(&self.storage.pool())
                .await?,
        })
    }

    /// Build the precise conflict error for a claim that found zero rows.
    async fn lost_claim(
        &self,
        tx: &mut sqlx::SqliteConnection,
        task_id: &str,
    ) -> CoordError {
        let holder: Option<String> =
            sqlx::query_scalar("SELECT assigned_agent FROM tasks WHERE id = ?")
                .bind(task_id)
                .fetch_one(&mut *tx)
                .await
                .unwrap_or(None);
        CoordError::AlreadyAssigned {
            task: task_id.to_string(),
            agent: holder.unwrap_or_default(),
        }
    }

    /// Idle the agent and detach it from its task. The task's own status is
    /// deliberately left untouched — it stays InProgress-unassigned for
    /// pickup, or the caller blocks it with a separate `transition`.
    /// Idempotent when the agent holds nothing. Returns the detached task id.
    pub async fn release(&self, agent_id: &str) -> CoordResult<Option<String>> {
        let mut tx = self.storage.pool().begin().await?;

        let agent: Agent = sqlx::query_as("SELECT * FROM agents WHERE id = ?")
            .bind(agent_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoordError::not_found("agent", agent_id))?;
        let Some(task_id) = agent.current_task else {
            drop(tx);
            return Ok(None);
        };

        let now = now_ts();
        sqlx::query(
            "UPDATE tasks SET assigned_agent = NULL, updated_at = ?
             WHERE id = ? AND assigned_agent = ?",
        )
        .bind(now)
        .bind(&task_id)
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE agents SET status = 'idle', current_task = NULL, last_status_change = ?
             WHERE id = ?",
        )
        .bind(now)
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM tasks WHERE id = ?")
            .bind(&task_id)
            .fetch_optional(&mut *tx)
            .await?;
        let status = status.unwrap_or_else(|| "in_progress".into());
        append_audit(
            &mut tx,
            &task_id,
            agent_id,
            Some(&status),
            &status,
            Some(&format!("released by {agent_id}")),
            None,
        )
        .await?;

        tx.commit().await?;
        info!(agent = %agent_id, task_id = %task_id, "agent released task");
        Ok(Some(task_id))
    }

    // ─── Heartbeats ───────────────────────────────────────────────────────────

    /// Record liveness. A heartbeat from a Blocked (reaped) agent revives it
    /// to Idle; Working and Idle agents keep their status.
    pub async fn heartbeat(&self, agent_id: &str) -> CoordResult<()> {
        let now = now_ts();
        let rows = sqlx::query(
            "UPDATE agents
             SET last_heartbeat = ?,
                 status = CASE WHEN status = 'blocked' THEN 'idle' ELSE status END,
                 last_status_change = CASE WHEN status = 'blocked' THEN ? ELSE last_status_change END
             WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(agent_id)
        .execute(&self.storage.pool())
        .await?
        .rows_affected();
        if rows == 0 {
            return Err(CoordError::not_found("agent", agent_id));
        }
        Ok(())
    }

    /// Release assignments whose holder stopped heartbeating.
    ///
    /// The task goes to Blocked (audited, lease-expired message) and the
    /// agent to Blocked until it heartbeats again. Skips pairs that moved
    /// underneath us between the scan and the fix.
    pub async fn reap_stale_assignments(
        &self,
        timeout_secs: i64,
    ) -> CoordResult<Vec<StaleAssignment>> {
        let cutoff = now_ts() - timeout_secs;
        let stale: Vec<(String, String)> = sqlx::query_as(
            "SELECT id, current_task FROM agents
             WHERE status = 'working' AND current_task IS NOT NULL
               AND last_heartbeat IS NOT NULL AND last_heartbeat < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.storage.pool())
        .await?;

        let mut reaped = Vec::new();
        for (agent_id, task_id) in stale {
            let mut tx = self.storage.pool().begin().await?;
            let now = now_ts();

            let rows = sqlx::query(
                "UPDATE tasks SET status = 'blocked', assigned_agent = NULL, updated_at = ?
                 WHERE id = ? AND status = 'in_progress' AND assigned_agent = ?",
            )
            .bind(now)
            .bind(&task_id)
            .bind(&agent_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if rows == 0 {
                // Already moved by someone else — nothing to reap.
                continue;
            }

            sqlx::query(
                "UPDATE agents SET status = 'blocked', current_task = NULL, last_status_change = ?
                 WHERE id = ? AND current_task = ?",
            )
            .bind(now)
            .bind(&agent_id)
            .bind(&task_id)
            .execute(&mut *tx)
            .await?;

            append_audit(
                &mut tx,
                &task_id,
                "janitor",
                Some("in_progress"),
                "blocked",
                Some(&format!("assignment lease expired for {agent_id} (no heartbeat)")),
                None,
            )
            .await?;
            tx.commit().await?;

            warn!(agent = %agent_id, task_id = %task_id, "stale assignment reaped");
            reaped.push(StaleAssignment { agent_id, task_id });
        }
        Ok(reaped)
    }

    // ─── Suggestion ───────────────────────────────────────────────────────────

    /// Rank Idle agents for the task (see `agents::suggest` for the scoring).
    /// Runs against a read snapshot; empty when no agent is Idle.
    pub async fn suggest(&self, task_id: &str) -> CoordResult<Vec<SuggestedAgent>> {
        let task: Task = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.storage.pool())
            .await?
            .ok_or_else(|| CoordError::not_found("task", task_id))?;
        let agents = self.list().await?;

        let epic_completed: HashMap<String, i64> = match task.epic {
            Some(ref epic) => {
                let rows: Vec<(String, i64)> = sqlx::query_as(
                    "SELECT a.actor, COUNT(*) FROM task_audit a
                     JOIN tasks t ON t.id = a.task_id
                     WHERE a.to_status = 'completed' AND t.epic = ?
                     GROUP BY a.actor",
                )
                .bind(epic)
                .fetch_all(&self.storage.pool())
                .await?;
                rows.into_iter().collect()
            }
            None => HashMap::new(),
        };

        Ok(suggest::rank(&task, &agents, &epic_completed, now_ts()))
    }
}
