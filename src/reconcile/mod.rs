// SPDX-License-Identifier: MIT
//! Completion reconciliation — evidence ingestion and the audit sweep.
//!
//! Matching proposes transitions through the ordinary state machine and
//! never forces them; an ambiguous fuzzy match becomes a first-class
//! conflict record for a human to resolve, not a tie-break.

pub mod evidence;

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{CoordError, CoordResult};
use crate::storage::{now_ts, Storage};
use crate::tasks::model::TaskStatus;
use crate::tasks::storage::TaskStore;

pub use evidence::{embedded_task_ids, fuzzy_candidates, CompletionEvidence, FUZZY_THRESHOLD};

// Evidence-log outcome labels.
const OUTCOME_APPLIED: &str = "applied";
const OUTCOME_CONFIRMED: &str = "confirmed";
const OUTCOME_REJECTED: &str = "proposal_rejected";
const OUTCOME_AMBIGUOUS: &str = "ambiguous";
const OUTCOME_NO_MATCH: &str = "no_match";

/// What happened to one ingested evidence item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// A confident match proposed Completed and the transition was accepted.
    Applied { task_id: String },
    /// The matched task was already Completed; evidence recorded as
    /// confirmation, nothing changed.
    Confirmed { task_id: String },
    /// A confident match existed but the state machine rejected the
    /// proposal (e.g. the task never started). Surfaced, not forced.
    ProposalRejected { task_id: String, reason: String },
    /// No task matched; the evidence is logged as an orphan.
    NoMatch,
}

/// A recorded ambiguous match awaiting manual resolution.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    pub source_ref: String,
    /// JSON array of candidate task ids.
    pub candidates: String,
    pub resolved: bool,
    pub created_at: i64,
}

impl ConflictRecord {
    pub fn candidate_ids(&self) -> Vec<String> {
        serde_json::from_str(&self.candidates).unwrap_or_default()
    }
}

/// Findings of the read-only sweep. Reporting only — applying any fix is a
/// separate, explicit operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Tasks marked Completed with no evidence on file.
    pub completed_without_evidence: Vec<String>,
    /// Evidence refs that matched no task.
    pub orphan_evidence: Vec<String>,
    /// Ambiguous-match conflicts still awaiting resolution.
    pub unresolved_conflicts: Vec<String>,
    /// True when the sweep stopped early on a cancellation request.
    pub cancelled: bool,
}

#[derive(Clone)]
pub struct Reconciler {
    storage: Arc<Storage>,
    tasks: TaskStore,
}

impl Reconciler {
    pub fn new(storage: Arc<Storage>, tasks: TaskStore) -> Self {
        Self { storage, tasks }
    }

    // ─── Ingestion ────────────────────────────────────────────────────────────

    /// Match one evidence item against the task set and record the outcome.
    ///
    /// Ambiguity (more than one candidate, from either pass) records a
    /// conflict and returns `AmbiguousMatch` — never auto-resolved.
    pub async fn ingest(&self, ev: &CompletionEvidence) -> CoordResult<MatchOutcome> {
        if ev.source_ref.trim().is_empty() {
            return Err(CoordError::Validation(
                "evidence source_ref must not be empty".into(),
            ));
        }

        let known: Vec<(String, String, TaskStatus)> =
            sqlx::query_as("SELECT id, title, status FROM tasks")
                .fetch_all(&self.storage.pool())
                .await?;

        // Pass 1 — exact id embedded in the title/path.
        let embedded = embedded_task_ids(ev);
        let exact: Vec<&(String, String, TaskStatus)> = known
            .iter()
            .filter(|(id, _, _)| embedded.iter().any(|e| e == id))
            .collect();

        match exact.len() {
            1 => {
                let (task_id, _, status) = exact[0];
                return self.apply_match(ev, task_id, *status).await;
            }
            n if n > 1 => {
                let candidates: Vec<String> =
                    exact.iter().map(|(id, _, _)| id.clone()).collect();
                return self.record_conflict(ev, candidates).await;
            }
            _ => {}
        }

        // Pass 2 — fuzzy title similarity against currently open tasks.
        let open: Vec<(String, String)> = known
            .iter()
            .filter(|(_, _, status)| !status.is_terminal())
            .map(|(id, title, _)| (id.clone(), title.clone()))
            .collect();
        let hits = fuzzy_candidates(&ev.title, &open);

        match hits.len() {
            0 => {
                self.log_evidence(ev, None, OUTCOME_NO_MATCH).await?;
                Ok(MatchOutcome::NoMatch)
            }
            1 => {
                let task_id = hits[0].0.clone();
                let status = known
                    .iter()
                    .find(|(id, _, _)| *id == task_id)
                    .map(|(_, _, s)| *s)
                    .unwrap_or(TaskStatus::InProgress);
                self.apply_match(ev, &task_id, status).await
            }
            _ => {
                let candidates: Vec<String> = hits.into_iter().map(|(id, _)| id).collect();
                self.record_conflict(ev, candidates).await
            }
        }
    }

    /// Propose Completed for a confidently matched task, carrying the
    /// evidence reference into the audit trail.
    async fn apply_match(
        &self,
        ev: &CompletionEvidence,
        task_id: &str,
        status: TaskStatus,
    ) -> CoordResult<MatchOutcome> {
        if status == TaskStatus::Completed {
            self.log_evidence(ev, Some(task_id), OUTCOME_CONFIRMED).await?;
            return Ok(MatchOutcome::Confirmed {
                task_id: task_id.to_string(),
            });
        }
        if status == TaskStatus::Cancelled {
            self.log_evidence(ev, None, OUTCOME_NO_MATCH).await?;
            return Ok(MatchOutcome::NoMatch);
        }

        match self
            .tasks
            .transition_full(
                task_id,
                TaskStatus::Completed,
                "reconciler",
                Some(&format!("evidence {}", ev.source_ref)),
                Some(&ev.source_ref),
            )
            .await
        {
            Ok(_) => {
                self.log_evidence(ev, Some(task_id), OUTCOME_APPLIED).await?;
                info!(task_id = %task_id, evidence = %ev.source_ref, "evidence applied");
                Ok(MatchOutcome::Applied {
                    task_id: task_id.to_string(),
                })
            }
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                self.log_evidence(ev, Some(task_id), OUTCOME_REJECTED).await?;
                Ok(MatchOutcome::ProposalRejected {
                    task_id: task_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn record_conflict(
        &self,
        ev: &CompletionEvidence,
        candidates: Vec<String>,
    ) -> CoordResult<MatchOutcome> {
        let candidates_json = serde_json::to_string(&candidates)
            .map_err(|e| CoordError::Validation(format!("unserializable candidates: {e}")))?;
        sqlx::query(
            "INSERT INTO evidence_conflicts (id, source_ref, candidates, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&ev.source_ref)
        .bind(&candidates_json)
        .bind(now_ts())
        .execute(&self.storage.pool())
        .await?;
        self.log_evidence(ev, None, OUTCOME_AMBIGUOUS).await?;

        Err(CoordError::AmbiguousMatch {
            evidence: ev.source_ref.clone(),
            candidates,
        })
    }

    async fn log_evidence(
        &self,
        ev: &CompletionEvidence,
        matched_task: Option<&str>,
        outcome: &str,
    ) -> CoordResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO evidence_log
             (source_ref, title, matched_task, outcome, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&ev.source_ref)
        .bind(&ev.title)
        .bind(matched_task)
        .bind(outcome)
        .bind(now_ts())
        .execute(&self.storage.pool())
        .await?;
        Ok(())
    }

    // ─── Conflicts ────────────────────────────────────────────────────────────

    /// Conflicts still awaiting a manual decision.
    pub async fn conflicts(&self) -> CoordResult<Vec<ConflictRecord>> {
        Ok(sqlx::query_as(
            "SELECT * FROM evidence_conflicts WHERE resolved = 0 ORDER BY created_at ASC",
        )
        .fetch_all(&self.storage.pool())
        .await?)
    }

    /// Manually resolve a recorded conflict toward one of its candidates.
    /// The chosen task gets the usual Completed proposal.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        task_id: &str,
    ) -> CoordResult<MatchOutcome> {
        let conflict: ConflictRecord =
            sqlx::query_as("SELECT * FROM evidence_conflicts WHERE id = ?")
                .bind(conflict_id)
                .fetch_optional(&self.storage.pool())
                .await?
                .ok_or_else(|| CoordError::not_found("conflict", conflict_id))?;
        if conflict.resolved {
            return Err(CoordError::Validation(format!(
                "conflict {conflict_id} is already resolved"
            )));
        }
        if !conflict.candidate_ids().iter().any(|c| c == task_id) {
            return Err(CoordError::Validation(format!(
                "task {task_id} is not a candidate of conflict {conflict_id}"
            )));
        }

        let status: TaskStatus = sqlx::query_scalar("SELECT status FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.storage.pool())
            .await?
            .ok_or_else(|| CoordError::not_found("task", task_id))?;

        let ev = CompletionEvidence {
            source_ref: conflict.source_ref.clone(),
            title: String::new(),
            body: String::new(),
        };
        let outcome = self.apply_match(&ev, task_id, status).await?;

        sqlx::query("UPDATE evidence_conflicts SET resolved = 1 WHERE id = ?")
            .bind(conflict_id)
            .execute(&self.storage.pool())
            .await?;
        Ok(outcome)
    }

    // ─── Sweep ────────────────────────────────────────────────────────────────

    /// Read-only cross-check of task status against the evidence log.
    /// Checks `cancel` between tasks and stops cleanly — no partial mutation
    /// is possible because nothing here mutates.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> CoordResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let matched: HashSet<String> = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT matched_task FROM evidence_log WHERE matched_task IS NOT NULL",
        )
        .fetch_all(&self.storage.pool())
        .await?
        .into_iter()
        .collect();

        report.orphan_evidence = sqlx::query_scalar(
            "SELECT source_ref FROM evidence_log WHERE outcome = 'no_match'
             ORDER BY created_at ASC, source_ref ASC",
        )
        .fetch_all(&self.storage.pool())
        .await?;

        report.unresolved_conflicts = sqlx::query_scalar(
            "SELECT source_ref FROM evidence_conflicts WHERE resolved = 0
             ORDER BY created_at ASC, source_ref ASC",
        )
        .fetch_all(&self.storage.pool())
        .await?;

        let completed: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM tasks WHERE status = 'completed' ORDER BY completed_at ASC, id ASC",
        )
        .fetch_all(&self.storage.pool())
        .await?;

        for task_id in completed {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(report);
            }
            if !matched.contains(&task_id) {
                report.completed_without_evidence.push(task_id);
            }
        }
        Ok(report)
    }
}
