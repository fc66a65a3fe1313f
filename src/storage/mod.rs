// SPDX-License-Identifier: MIT
//! Embedded durable store — SQLite via sqlx, WAL mode.
//!
//! One pool, capped at a single connection: SQLite serializes writers anyway,
//! and a single connection turns every read-validate-write-audit sequence
//! wrapped in a transaction into one isolation boundary. Concurrent callers
//! queue; the loser of a claim race observes the winner's committed state and
//! receives a typed conflict error instead of corrupting anything.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CoordError, CoordResult};

/// Default bound for individual queries. Exceeding it surfaces the retryable
/// `StoreUnavailable` instead of hanging the caller.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Current unix timestamp in seconds.
pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
    query_timeout: Duration,
}

impl Storage {
    /// Open (or create) the store under `data_dir` with the default timeout.
    pub async fn open(data_dir: &Path) -> CoordResult<Self> {
        Self::open_with_timeout(data_dir, DEFAULT_QUERY_TIMEOUT).await
    }

    pub async fn open_with_timeout(
        data_dir: &Path,
        query_timeout: Duration,
    ) -> CoordResult<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| CoordError::StoreUnavailable(format!("create data dir: {e}")))?;
        let db_path = data_dir.join("crewd.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(Duration::from_secs(5))
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self {
            pool,
            query_timeout,
        })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Execute a store interaction with the standard bounded timeout.
    pub(crate) async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = CoordResult<T>>,
    ) -> CoordResult<T> {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CoordError::StoreUnavailable(format!(
                "query timed out after {}s",
                self.query_timeout.as_secs()
            ))),
        }
    }

    /// Idempotent schema creation. Tasks are never physically deleted —
    /// cancellation is a terminal status — so there is no archive table.
    async fn migrate(pool: &SqlitePool) -> CoordResult<()> {
        let stmts = [
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                priority TEXT NOT NULL DEFAULT 'medium',
                epic TEXT,
                parent_id TEXT,
                assigned_agent TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                estimated_minutes INTEGER,
                actual_minutes INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                completed_at INTEGER
            )",
            "CREATE TABLE IF NOT EXISTS task_deps (
                task_id TEXT NOT NULL,
                depends_on TEXT NOT NULL,
                kind TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (task_id, depends_on)
            )",
            "CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'idle',
                current_task TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                completed_count INTEGER NOT NULL DEFAULT 0,
                est_ratio_avg REAL,
                last_status_change INTEGER NOT NULL,
                last_heartbeat INTEGER,
                created_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS acceptance_criteria (
                task_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                description TEXT NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                completed_at INTEGER,
                PRIMARY KEY (task_id, position)
            )",
            "CREATE TABLE IF NOT EXISTS task_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                actor TEXT NOT NULL,
                from_status TEXT,
                to_status TEXT NOT NULL,
                message TEXT,
                evidence_ref TEXT,
                created_at INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_audit_task
                ON task_audit (task_id, created_at)",
            "CREATE TABLE IF NOT EXISTS evidence_log (
                source_ref TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                matched_task TEXT,
                outcome TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS evidence_conflicts (
                id TEXT PRIMARY KEY,
                source_ref TEXT NOT NULL,
                candidates TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )",
        ];
        for stmt in stmts {
            sqlx::query(stmt).execute(pool).await?;
        }
        Ok(())
    }
}
