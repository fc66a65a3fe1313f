// graph/storage.rs — store-side dependency operations.
//
// `add_dependency` is check-before-insert inside one transaction: the edge is
// validated against a snapshot of the full edge set (plus parent links) and
// never exists, even transiently, if it would close a cycle.

use std::sync::Arc;

use sqlx::SqliteConnection;
use tracing::debug;

use crate::error::{CoordError, CoordResult};
use crate::graph::{DepGraph, DepKind, DependencyTree, Edge};
use crate::storage::{now_ts, Storage};
use crate::tasks::model::Task;
use crate::tasks::storage::append_audit;

/// True when every `requires` prerequisite of `task_id` is Completed or
/// Cancelled. Cancelled prerequisites deliberately unblock dependents: a
/// cancelled task can never complete, so counting it as a hard block would
/// deadlock everything downstream of it forever.
pub(crate) async fn requires_satisfied(
    conn: &mut SqliteConnection,
    task_id: &str,
) -> CoordResult<bool> {
    let unfinished: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM task_deps d
         JOIN tasks t ON t.id = d.depends_on
         WHERE d.task_id = ? AND d.kind = 'requires'
           AND t.status NOT IN ('completed', 'cancelled')",
    )
    .bind(task_id)
    .fetch_one(conn)
    .await?;
    Ok(unfinished == 0)
}

#[derive(Clone)]
pub struct GraphStore {
    storage: Arc<Storage>,
}

impl GraphStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Insert a dependency edge after proving it cannot close a cycle.
    /// On `CycleDetected` the edge set is left unchanged.
    pub async fn add_dependency(
        &self,
        task_id: &str,
        depends_on: &str,
        kind: DepKind,
    ) -> CoordResult<()> {
        self.storage
            .with_timeout(self.add_dependency_tx(task_id, depends_on, kind))
            .await
    }

    async fn add_dependency_tx(
        &self,
        task_id: &str,
        depends_on: &str,
        kind: DepKind,
    ) -> CoordResult<()> {
        let mut tx = self.storage.pool().begin().await?;

        let task: Task = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoordError::not_found("task", task_id))?;
        let dep_exists: Option<(String,)> = sqlx::query_as("SELECT id FROM tasks WHERE id = ?")
            .bind(depends_on)
            .fetch_optional(&mut *tx)
            .await?;
        if dep_exists.is_none() {
            return Err(CoordError::not_found("task", depends_on));
        }

        let duplicate: Option<(String,)> = sqlx::query_as(
            "SELECT task_id FROM task_deps WHERE task_id = ? AND depends_on = ?",
        )
        .bind(task_id)
        .bind(depends_on)
        .fetch_optional(&mut *tx)
        .await?;
        if duplicate.is_some() {
            return Err(CoordError::Validation(format!(
                "dependency {task_id} -> {depends_on} already exists"
            )));
        }

        let graph = snapshot_on(&mut tx).await?;
        if graph.would_cycle(task_id, depends_on) {
            return Err(CoordError::CycleDetected {
                task: task_id.to_string(),
                depends_on: depends_on.to_string(),
            });
        }

        sqlx::query(
            "INSERT INTO task_deps (task_id, depends_on, kind, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(depends_on)
        .bind(kind)
        .bind(now_ts())
        .execute(&mut *tx)
        .await?;

        append_audit(
            &mut tx,
            task_id,
            "operator",
            Some(task.status.as_str()),
            task.status.as_str(),
            Some(&format!("{kind} {depends_on}")),
            None,
        )
        .await?;

        tx.commit().await?;
        debug!(task_id = %task_id, depends_on = %depends_on, kind = %kind, "dependency added");
        Ok(())
    }

    /// True iff every `requires` prerequisite is Completed or Cancelled.
    pub async fn is_ready(&self, task_id: &str) -> CoordResult<bool> {
        let mut conn = self.storage.pool().acquire().await?;
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&mut *conn)
            .await?;
        if exists.is_none() {
            return Err(CoordError::not_found("task", task_id));
        }
        requires_satisfied(&mut conn, task_id).await
    }

    /// All Pending, unassigned, Ready tasks — priority descending, then
    /// creation time ascending, then id. Deterministic for testing.
    pub async fn ready_set(&self) -> CoordResult<Vec<Task>> {
        self.storage
            .with_timeout(async {
                let mut conn = self.storage.pool().acquire().await?;
                let candidates: Vec<Task> = sqlx::query_as(
                    "SELECT * FROM tasks
                     WHERE status = 'pending' AND assigned_agent IS NULL
                     ORDER BY CASE priority
                         WHEN 'critical' THEN 0 WHEN 'high' THEN 1
                         WHEN 'medium' THEN 2 ELSE 3 END,
                       created_at ASC, id ASC",
                )
                .fetch_all(&mut *conn)
                .await?;

                let mut ready = Vec::with_capacity(candidates.len());
                for task in candidates {
                    if requires_satisfied(&mut conn, &task.id).await? {
                        ready.push(task);
                    }
                }
                Ok(ready)
            })
            .await
    }

    /// Lazy breadth-first walk of the task's transitive dependencies, built
    /// over a consistent snapshot of the edge set.
    pub async fn dependency_tree(&self, task_id: &str) -> CoordResult<DependencyTree> {
        let mut conn = self.storage.pool().acquire().await?;
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&mut *conn)
            .await?;
        if exists.is_none() {
            return Err(CoordError::not_found("task", task_id));
        }
        let graph = snapshot_on(&mut conn).await?;
        Ok(graph.into_walk(task_id))
    }

    /// All persisted edges (display/debugging).
    pub async fn edges(&self) -> CoordResult<Vec<Edge>> {
        Ok(
            sqlx::query_as("SELECT * FROM task_deps ORDER BY created_at ASC, task_id ASC")
                .fetch_all(&self.storage.pool())
                .await?,
        )
    }
}

/// Build the arena snapshot (dependency edges + parent links) on an existing
/// connection so callers inside a transaction see their own view.
async fn snapshot_on(conn: &mut SqliteConnection) -> CoordResult<DepGraph> {
    let edges: Vec<(String, String, DepKind)> =
        sqlx::query_as("SELECT task_id, depends_on, kind FROM task_deps")
            .fetch_all(&mut *conn)
            .await?;
    let parents: Vec<(String, String)> =
        sqlx::query_as("SELECT parent_id, id FROM tasks WHERE parent_id IS NOT NULL")
            .fetch_all(&mut *conn)
            .await?;

    let mut graph = DepGraph::new();
    for (task, dep, kind) in &edges {
        graph.add_dep(task, dep, *kind);
    }
    for (parent, child) in &parents {
        graph.add_parent(parent, child);
    }
    Ok(graph)
}
