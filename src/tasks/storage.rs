// tasks/storage.rs — Task CRUD and the transactional state machine.
//
// Every mutation here is one SQLite transaction: read current state, validate
// preconditions, write, append the audit entry. The audit trail is the only
// observable side-effect channel.

use std::sync::Arc;

use sqlx::SqliteConnection;
use tracing::info;

use crate::error::{CoordError, CoordResult};
use crate::graph::storage::requires_satisfied;
use crate::storage::{now_ts, Storage};
use crate::tasks::model::{AuditEntry, ProgressSummary, Task, TaskDraft, TaskStatus};
use crate::tasks::state;

/// Result of a successful transition. `newly_ready` lists dependent tasks
/// that became Ready because this task reached a terminal-satisfying state —
/// a pure read-side computation, no other task's stored state changes.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub task: Task,
    pub newly_ready: Vec<String>,
}

/// Append one audit entry on the given connection (caller owns the
/// transaction boundary).
pub(crate) async fn append_audit(
    conn: &mut SqliteConnection,
    task_id: &str,
    actor: &str,
    from_status: Option<&str>,
    to_status: &str,
    message: Option<&str>,
    evidence_ref: Option<&str>,
) -> CoordResult<()> {
    sqlx::query(
        "INSERT INTO task_audit
         (task_id, actor, from_status, to_status, message, evidence_ref, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(task_id)
    .bind(actor)
    .bind(from_status)
    .bind(to_status)
    .bind(message)
    .bind(evidence_ref)
    .bind(now_ts())
    .execute(conn)
    .await?;
    Ok(())
}

#[derive(Clone)]
pub struct TaskStore {
    storage: Arc<Storage>,
    /// `[policy] require_criteria_complete` — gate →Completed on criteria.
    require_criteria_complete: bool,
}

impl TaskStore {
    pub fn new(storage: Arc<Storage>, require_criteria_complete: bool) -> Self {
        Self {
            storage,
            require_criteria_complete,
        }
    }

    // ─── CRUD ─────────────────────────────────────────────────────────────────

    pub async fn create(&self, draft: TaskDraft) -> CoordResult<Task> {
        if draft.id.trim().is_empty() {
            return Err(CoordError::Validation("task id must not be empty".into()));
        }
        if draft.title.trim().is_empty() {
            return Err(CoordError::Validation("task title must not be empty".into()));
        }

        let mut tx = self.storage.pool().begin().await?;

        let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM tasks WHERE id = ?")
            .bind(&draft.id)
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_some() {
            return Err(CoordError::Validation(format!(
                "task id {} already exists",
                draft.id
            )));
        }
        if let Some(ref parent) = draft.parent_id {
            let found: Option<(String,)> = sqlx::query_as("SELECT id FROM tasks WHERE id = ?")
                .bind(parent)
                .fetch_optional(&mut *tx)
                .await?;
            if found.is_none() {
                return Err(CoordError::not_found("task", parent.clone()));
            }
        }

        let now = now_ts();
        let tags = serde_json::to_string(&draft.tags)
            .map_err(|e| CoordError::Validation(format!("unserializable tags: {e}")))?;
        sqlx::query(
            "INSERT INTO tasks
             (id, title, status, priority, epic, parent_id, tags, estimated_minutes,
              created_at, updated_at)
             VALUES (?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&draft.id)
        .bind(draft.title.trim())
        .bind(draft.priority)
        .bind(&draft.epic)
        .bind(&draft.parent_id)
        .bind(&tags)
        .bind(draft.estimated_minutes)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        append_audit(&mut tx, &draft.id, "operator", None, "pending", None, None).await?;
        tx.commit().await?;

        self.require(&draft.id).await
    }

    pub async fn get(&self, id: &str) -> CoordResult<Option<Task>> {
        Ok(sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.storage.pool())
            .await?)
    }

    pub async fn require(&self, id: &str) -> CoordResult<Task> {
        self.get(id)
            .await?
            .ok_or_else(|| CoordError::not_found("task", id))
    }

    pub async fn list(&self) -> CoordResult<Vec<Task>> {
        self.storage
            .with_timeout(async {
                Ok(
                    sqlx::query_as("SELECT * FROM tasks ORDER BY created_at ASC, id ASC")
                        .fetch_all(&self.storage.pool())
                        .await?,
                )
            })
            .await
    }

    /// Tasks still eligible for evidence matching (not yet terminal).
    pub async fn open_tasks(&self) -> CoordResult<Vec<Task>> {
        Ok(sqlx::query_as(
            "SELECT * FROM tasks WHERE status NOT IN ('completed', 'cancelled')
             ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.storage.pool())
        .await?)
    }

    // ─── Transitions ──────────────────────────────────────────────────────────

    /// Apply a lifecycle transition. See `tasks::state` for the edge table.
    pub async fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        actor: &str,
        message: Option<&str>,
    ) -> CoordResult<TransitionOutcome> {
        self.transition_full(task_id, to, actor, message, None).await
    }

    pub(crate) async fn transition_full(
        &self,
        task_id: &str,
        to: TaskStatus,
        actor: &str,
        message: Option<&str>,
        evidence_ref: Option<&str>,
    ) -> CoordResult<TransitionOutcome> {
        self.storage
            .with_timeout(self.transition_tx(task_id, to, actor, message, evidence_ref))
            .await
    }

    async fn transition_tx(
        &self,
        task_id: &str,
        to: TaskStatus,
        actor: &str,
        message: Option<&str>,
        evidence_ref: Option<&str>,
    ) -> CoordResult<TransitionOutcome> {
        let mut tx = self.storage.pool().begin().await?;

        let task: Task = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoordError::not_found("task", task_id))?;
        let from = task.status;

        state::validate(from, to)?;

        if state::needs_readiness(from, to) && !requires_satisfied(&mut tx, task_id).await? {
            return Err(CoordError::NotReady(task_id.to_string()));
        }
        if to == TaskStatus::Cancelled && message.map_or(true, |m| m.trim().is_empty()) {
            return Err(CoordError::Validation(
                "cancellation requires a non-empty reason".into(),
            ));
        }
        if to == TaskStatus::Completed && self.require_criteria_complete {
            let unchecked: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM acceptance_criteria WHERE task_id = ? AND completed = 0",
            )
            .bind(task_id)
            .fetch_one(&mut *tx)
            .await?;
            if unchecked > 0 {
                return Err(CoordError::Validation(format!(
                    "task {task_id} has {unchecked} unchecked acceptance criteria"
                )));
            }
        }

        let now = now_ts();
        let completed_at = (to == TaskStatus::Completed).then_some(now);
        let actual_minutes = if to == TaskStatus::Completed {
            // Wall-clock from the first time the task went active.
            let started: Option<i64> = sqlx::query_scalar(
                "SELECT MIN(created_at) FROM task_audit
                 WHERE task_id = ? AND to_status = 'in_progress'",
            )
            .bind(task_id)
            .fetch_one(&mut *tx)
            .await?;
            started.map(|s| (now - s) / 60)
        } else {
            None
        };

        // Leaving InProgress always drops the assignment: an agent may only
        // point at a task that is actively running (§ data-model invariant).
        let leaving_in_progress = from == TaskStatus::InProgress && to != TaskStatus::InProgress;

        sqlx::query(
            "UPDATE tasks
             SET status = ?, updated_at = ?,
                 completed_at = COALESCE(?, completed_at),
                 actual_minutes = COALESCE(?, actual_minutes),
                 assigned_agent = CASE WHEN ? THEN NULL ELSE assigned_agent END
             WHERE id = ?",
        )
        .bind(to)
        .bind(now)
        .bind(completed_at)
        .bind(actual_minutes)
        .bind(leaving_in_progress)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        if leaving_in_progress {
            if let Some(ref agent_id) = task.assigned_agent {
                self.settle_agent(&mut tx, agent_id, &task, to, actual_minutes, now)
                    .await?;
            }
        }

        append_audit(
            &mut tx,
            task_id,
            actor,
            Some(from.as_str()),
            to.as_str(),
            message,
            evidence_ref,
        )
        .await?;

        let newly_ready = if to == TaskStatus::Completed || to == TaskStatus::Cancelled {
            self.newly_ready_dependents(&mut tx, task_id).await?
        } else {
            Vec::new()
        };

        tx.commit().await?;

        info!(task_id = %task_id, from = %from, to = %to, actor = %actor, "task transition");

        let task = self.require(task_id).await?;
        Ok(TransitionOutcome { task, newly_ready })
    }

    /// Idle the holder of a task that just left InProgress; on completion,
    /// fold the duration ratio into the agent's running accuracy counters.
    async fn settle_agent(
        &self,
        tx: &mut SqliteConnection,
        agent_id: &str,
        task: &Task,
        to: TaskStatus,
        actual_minutes: Option<i64>,
        now: i64,
    ) -> CoordResult<()> {
        sqlx::query(
            "UPDATE agents SET status = 'idle', current_task = NULL, last_status_change = ?
             WHERE id = ? AND current_task = ?",
        )
        .bind(now)
        .bind(agent_id)
        .bind(&task.id)
        .execute(&mut *tx)
        .await?;

        if to != TaskStatus::Completed {
            return Ok(());
        }

        let row: Option<(i64, Option<f64>)> =
            sqlx::query_as("SELECT completed_count, est_ratio_avg FROM agents WHERE id = ?")
                .bind(agent_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((count, avg)) = row else {
            return Ok(());
        };

        let ratio = match (task.estimated_minutes, actual_minutes) {
            (Some(est), Some(act)) if est > 0 => Some(act as f64 / est as f64),
            _ => None,
        };
        let new_avg = match (avg, ratio) {
            (Some(avg), Some(r)) => Some((avg * count as f64 + r) / (count as f64 + 1.0)),
            (None, Some(r)) => Some(r),
            (existing, None) => existing,
        };

        sqlx::query(
            "UPDATE agents SET completed_count = completed_count + 1, est_ratio_avg = ?
             WHERE id = ?",
        )
        .bind(new_avg)
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;
        Ok(())
    }

    /// Dependents of `task_id` that are Pending, unassigned, and now Ready.
    /// Ordered by priority descending then creation time ascending.
    async fn newly_ready_dependents(
        &self,
        tx: &mut SqliteConnection,
        task_id: &str,
    ) -> CoordResult<Vec<String>> {
        let dependents: Vec<Task> = sqlx::query_as(
            "SELECT t.* FROM tasks t
             JOIN task_deps d ON d.task_id = t.id
             WHERE d.depends_on = ? AND d.kind = 'requires'
               AND t.status = 'pending' AND t.assigned_agent IS NULL
             ORDER BY CASE t.priority
                 WHEN 'critical' THEN 0 WHEN 'high' THEN 1 WHEN 'medium' THEN 2 ELSE 3 END,
               t.created_at ASC, t.id ASC",
        )
        .bind(task_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut ready = Vec::new();
        for dep in dependents {
            if requires_satisfied(&mut *tx, &dep.id).await? {
                ready.push(dep.id);
            }
        }
        Ok(ready)
    }

    // ─── Audit & progress ─────────────────────────────────────────────────────

    /// Ordered audit trail for one task.
    pub async fn audit_trail(&self, task_id: &str) -> CoordResult<Vec<AuditEntry>> {
        Ok(sqlx::query_as(
            "SELECT * FROM task_audit WHERE task_id = ? ORDER BY id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.storage.pool())
        .await?)
    }

    /// Counts by status across the whole task set.
    pub async fn progress(&self) -> CoordResult<ProgressSummary> {
        let rows: Vec<(TaskStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.storage.pool())
                .await?;

        let mut summary = ProgressSummary::default();
        for (status, count) in rows {
            summary.total += count;
            match status {
                TaskStatus::Pending => summary.pending = count,
                TaskStatus::InProgress => summary.in_progress = count,
                TaskStatus::Blocked => summary.blocked = count,
                TaskStatus::Review => summary.review = count,
                TaskStatus::Completed => summary.completed = count,
                TaskStatus::Cancelled => summary.cancelled = count,
            }
        }
        Ok(summary)
    }
}
