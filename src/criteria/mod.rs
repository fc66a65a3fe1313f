// criteria/mod.rs — per-task ordered acceptance checklist.
//
// Criteria are advisory by default: completing a task with unchecked items is
// allowed unless `[policy] require_criteria_complete` turns the gate on (the
// gate itself lives in the task transition, not here).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CoordError, CoordResult};
use crate::storage::{now_ts, Storage};

/// One checklist item. Positions are 1-based and stable per task.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Criterion {
    pub task_id: String,
    pub position: i64,
    pub description: String,
    pub completed: bool,
    pub completed_at: Option<i64>,
}

#[derive(Clone)]
pub struct CriteriaTracker {
    storage: Arc<Storage>,
}

impl CriteriaTracker {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Append a criterion at the next position.
    pub async fn add(&self, task_id: &str, description: &str) -> CoordResult<Criterion> {
        if description.trim().is_empty() {
            return Err(CoordError::Validation(
                "criterion description must not be empty".into(),
            ));
        }

        let mut tx = self.storage.pool().begin().await?;
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(CoordError::not_found("task", task_id));
        }

        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(position), 0) + 1 FROM acceptance_criteria WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO acceptance_criteria (task_id, position, description)
             VALUES (?, ?, ?)",
        )
        .bind(task_id)
        .bind(next)
        .bind(description.trim())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Criterion {
            task_id: task_id.to_string(),
            position: next,
            description: description.trim().to_string(),
            completed: false,
            completed_at: None,
        })
    }

    pub async fn list(&self, task_id: &str) -> CoordResult<Vec<Criterion>> {
        Ok(sqlx::query_as(
            "SELECT * FROM acceptance_criteria WHERE task_id = ? ORDER BY position ASC",
        )
        .bind(task_id)
        .fetch_all(&self.storage.pool())
        .await?)
    }

    /// Mark the criterion at `position` complete.
    pub async fn check(&self, task_id: &str, position: i64) -> CoordResult<()> {
        self.set_completed(task_id, position, true).await
    }

    /// Clear the completed flag (and its timestamp) at `position`.
    pub async fn uncheck(&self, task_id: &str, position: i64) -> CoordResult<()> {
        self.set_completed(task_id, position, false).await
    }

    async fn set_completed(&self, task_id: &str, position: i64, done: bool) -> CoordResult<()> {
        let completed_at = done.then(now_ts);
        let rows = sqlx::query(
            "UPDATE acceptance_criteria SET completed = ?, completed_at = ?
             WHERE task_id = ? AND position = ?",
        )
        .bind(done)
        .bind(completed_at)
        .bind(task_id)
        .bind(position)
        .execute(&self.storage.pool())
        .await?
        .rows_affected();
        if rows == 0 {
            return Err(CoordError::not_found(
                "criterion",
                format!("{task_id}#{position}"),
            ));
        }
        Ok(())
    }

    /// `completed / total`, defined as 0.0 for a task with no criteria.
    pub async fn completion_ratio(&self, task_id: &str) -> CoordResult<f64> {
        let (total, done): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(completed), 0)
             FROM acceptance_criteria WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_one(&self.storage.pool())
        .await?;
        if total == 0 {
            Ok(0.0)
        } else {
            Ok(done as f64 / total as f64)
        }
    }
}
