//! crewd — coordination core for a pool of autonomous agents working a
//! dependency-ordered task set.
//!
//! The crate exposes one [`Coordinator`] value wiring the parts together:
//! dependency graph, task state machine, agent registry, acceptance
//! criteria, completion reconciliation, and the notification engine. Create
//! it at startup, share it via clone/`Arc`, discard it at exit — the
//! notification engine's rate-limit and milestone state lives inside the
//! value, never in a hidden process-wide singleton.
//!
//! Rendering, document parsing, actual alert delivery, and the command
//! surface are external collaborators; see `NotificationSink` for the only
//! outbound trait.

pub mod agents;
pub mod config;
pub mod criteria;
pub mod error;
pub mod graph;
pub mod notify;
pub mod reconcile;
pub mod storage;
pub mod tasks;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use agents::registry::{AgentRegistry, SyncOutcome};
use agents::{Agent, StaleAssignment, SuggestedAgent};
use config::CoordConfig;
use criteria::{CriteriaTracker, Criterion};
use error::CoordResult;
use graph::{DepKind, DependencyTree, GraphStore};
use notify::{DispatchOutcome, NotificationEngine, NotificationSink, NotifyEvent, TracingSink};
use reconcile::{CompletionEvidence, ConflictRecord, MatchOutcome, ReconcileReport, Reconciler};
use storage::Storage;
use tasks::{AuditEntry, ProgressSummary, Task, TaskDraft, TaskStatus, TaskStore, TransitionOutcome};

/// Install a global tracing subscriber honoring `RUST_LOG` (default `info`).
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Shared coordination context. Cheap to clone; all parts share one store.
#[derive(Clone)]
pub struct Coordinator {
    pub config: Arc<CoordConfig>,
    pub storage: Arc<Storage>,
    pub tasks: TaskStore,
    pub graph: GraphStore,
    pub agents: AgentRegistry,
    pub criteria: CriteriaTracker,
    pub reconciler: Reconciler,
    pub notifier: Arc<NotificationEngine>,
}

impl Coordinator {
    /// Open the store and wire every part, logging notifications only.
    pub async fn open(config: CoordConfig) -> CoordResult<Self> {
        Self::open_with_sink(config, Arc::new(TracingSink)).await
    }

    /// Open with a caller-provided delivery sink.
    pub async fn open_with_sink(
        config: CoordConfig,
        sink: Arc<dyn NotificationSink>,
    ) -> CoordResult<Self> {
        let storage = Arc::new(
            Storage::open_with_timeout(
                &config.store.data_dir,
                Duration::from_secs(config.store.query_timeout_secs),
            )
            .await?,
        );
        let tasks = TaskStore::new(
            Arc::clone(&storage),
            config.policy.require_criteria_complete,
        );
        let notifier = Arc::new(NotificationEngine::new(config.notifications.clone(), sink));
        Ok(Self {
            graph: GraphStore::new(Arc::clone(&storage)),
            agents: AgentRegistry::new(Arc::clone(&storage)),
            criteria: CriteriaTracker::new(Arc::clone(&storage)),
            reconciler: Reconciler::new(Arc::clone(&storage), tasks.clone()),
            tasks,
            notifier,
            storage,
            config: Arc::new(config),
        })
    }

    // ─── Tasks & lifecycle ────────────────────────────────────────────────────

    pub async fn create_task(&self, draft: TaskDraft) -> CoordResult<Task> {
        self.tasks.create(draft).await
    }

    /// Apply a lifecycle transition; a completion additionally feeds the
    /// notification engine (task-complete event + milestone check). Delivery
    /// failures never surface here — the transition result stands alone.
    pub async fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        actor: &str,
        message: Option<&str>,
    ) -> CoordResult<TransitionOutcome> {
        let outcome = self.tasks.transition(task_id, to, actor, message).await?;
        if to == TaskStatus::Completed {
            self.after_completion(&outcome.task, actor).await;
        }
        Ok(outcome)
    }

    pub async fn audit_trail(&self, task_id: &str) -> CoordResult<Vec<AuditEntry>> {
        self.tasks.audit_trail(task_id).await
    }

    pub async fn progress(&self) -> CoordResult<ProgressSummary> {
        self.tasks.progress().await
    }

    // ─── Dependency graph ─────────────────────────────────────────────────────

    pub async fn add_dependency(
        &self,
        task_id: &str,
        depends_on: &str,
        kind: DepKind,
    ) -> CoordResult<()> {
        self.graph.add_dependency(task_id, depends_on, kind).await
    }

    pub async fn is_ready(&self, task_id: &str) -> CoordResult<bool> {
        self.graph.is_ready(task_id).await
    }

    pub async fn ready_set(&self) -> CoordResult<Vec<Task>> {
        self.graph.ready_set().await
    }

    pub async fn dependency_tree(&self, task_id: &str) -> CoordResult<DependencyTree> {
        self.graph.dependency_tree(task_id).await
    }

    // ─── Agents ───────────────────────────────────────────────────────────────

    pub async fn create_agent(&self, id: &str, name: &str, tags: &[String]) -> CoordResult<Agent> {
        self.agents.create(id, name, tags).await
    }

    pub async fn sync(&self, agent_id: &str, task_id: &str) -> CoordResult<SyncOutcome> {
        self.agents.sync(agent_id, task_id).await
    }

    pub async fn release(&self, agent_id: &str) -> CoordResult<Option<String>> {
        self.agents.release(agent_id).await
    }

    pub async fn heartbeat(&self, agent_id: &str) -> CoordResult<()> {
        self.agents.heartbeat(agent_id).await
    }

    pub async fn suggest(&self, task_id: &str) -> CoordResult<Vec<SuggestedAgent>> {
        self.agents.suggest(task_id).await
    }

    /// Janitor entry point: break assignments whose holder went dark (see
    /// `[store] heartbeat_timeout_secs`).
    pub async fn reap_stale_assignments(&self) -> CoordResult<Vec<StaleAssignment>> {
        self.agents
            .reap_stale_assignments(self.config.store.heartbeat_timeout_secs)
            .await
    }

    /// Record an agent-reported failure and offer it to the notifier.
    pub async fn report_agent_error(&self, agent_id: &str, message: &str) -> DispatchOutcome {
        self.notifier
            .notify(&NotifyEvent::agent_error(agent_id, message))
            .await
    }

    // ─── Acceptance criteria ──────────────────────────────────────────────────

    pub async fn add_criterion(&self, task_id: &str, description: &str) -> CoordResult<Criterion> {
        self.criteria.add(task_id, description).await
    }

    pub async fn check_criterion(&self, task_id: &str, position: i64) -> CoordResult<()> {
        self.criteria.check(task_id, position).await
    }

    pub async fn uncheck_criterion(&self, task_id: &str, position: i64) -> CoordResult<()> {
        self.criteria.uncheck(task_id, position).await
    }

    pub async fn completion_ratio(&self, task_id: &str) -> CoordResult<f64> {
        self.criteria.completion_ratio(task_id).await
    }

    // ─── Reconciliation ───────────────────────────────────────────────────────

    pub async fn ingest_evidence(&self, ev: &CompletionEvidence) -> CoordResult<MatchOutcome> {
        let outcome = self.reconciler.ingest(ev).await?;
        if let MatchOutcome::Applied { ref task_id } = outcome {
            if let Ok(Some(task)) = self.tasks.get(task_id).await {
                self.after_completion(&task, "reconciler").await;
            }
        }
        Ok(outcome)
    }

    pub async fn conflicts(&self) -> CoordResult<Vec<ConflictRecord>> {
        self.reconciler.conflicts().await
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        task_id: &str,
    ) -> CoordResult<MatchOutcome> {
        let outcome = self.reconciler.resolve_conflict(conflict_id, task_id).await?;
        if let MatchOutcome::Applied { ref task_id } = outcome {
            if let Ok(Some(task)) = self.tasks.get(task_id).await {
                self.after_completion(&task, "reconciler").await;
            }
        }
        Ok(outcome)
    }

    pub async fn reconcile(&self, cancel: &CancellationToken) -> CoordResult<ReconcileReport> {
        self.reconciler.reconcile(cancel).await
    }

    // ─── Notifications ────────────────────────────────────────────────────────

    pub async fn notify(&self, event: &NotifyEvent) -> DispatchOutcome {
        self.notifier.notify(event).await
    }

    /// Completion hook: task-complete event plus milestone detection. Both
    /// are best-effort observers of an already-committed mutation.
    async fn after_completion(&self, task: &Task, actor: &str) {
        self.notifier
            .notify(&NotifyEvent::task_complete(&task.id, &task.title, actor))
            .await;
        if let Ok(progress) = self.tasks.progress().await {
            self.notifier.check_progress(&progress).await;
        }
    }
}
