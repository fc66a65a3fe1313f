//! Integration tests for the task lifecycle: the dependency-gated claim
//! walkthrough, audit trail, completion bookkeeping, and the criteria
//! policy gate.

use anyhow::Result;
use crewd::agents::AgentStatus;
use crewd::config::CoordConfig;
use crewd::error::CoordError;
use crewd::graph::DepKind;
use crewd::tasks::{TaskDraft, TaskStatus};
use crewd::Coordinator;

async fn open_coordinator() -> Result<(Coordinator, tempfile::TempDir)> {
    let dir = tempfile::tempdir()?;
    let mut config = CoordConfig::default();
    config.store.data_dir = dir.path().join("store");
    let coord = Coordinator::open(config).await?;
    Ok((coord, dir))
}

// ─── The walkthrough: blocked → ready → claimed ──────────────────────────────

#[tokio::test]
async fn test_dependency_gated_claim_walkthrough() -> Result<()> {
    let (coord, _dir) = open_coordinator().await?;
    coord.create_task(TaskDraft::new("T-1", "task A")).await?;
    coord.create_task(TaskDraft::new("T-2", "task B")).await?;
    coord.add_dependency("T-2", "T-1", DepKind::Requires).await?;
    coord.create_agent("agent-1", "Agent One", &[]).await?;

    // B is gated on A: sync must fail NotReady.
    let err = coord.sync("agent-1", "T-2").await.expect_err("B is not ready");
    assert!(matches!(err, CoordError::NotReady(_)), "got: {err}");

    // Work A to completion.
    coord
        .transition("T-1", TaskStatus::InProgress, "operator", None)
        .await?;
    let outcome = coord
        .transition("T-1", TaskStatus::Completed, "operator", None)
        .await?;
    assert_eq!(outcome.newly_ready, vec!["T-2"], "B becomes ready");

    let ready: Vec<String> = coord.ready_set().await?.into_iter().map(|t| t.id).collect();
    assert!(ready.contains(&"T-2".to_string()));

    // Now the claim goes through atomically.
    let sync = coord.sync("agent-1", "T-2").await?;
    assert_eq!(sync.task.status, TaskStatus::InProgress);
    assert_eq!(sync.task.assigned_agent.as_deref(), Some("agent-1"));
    assert_eq!(sync.agent.status, AgentStatus::Working);
    assert_eq!(sync.agent.current_task.as_deref(), Some("T-2"));
    Ok(())
}

// ─── Transition rules ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_completed_at_set_exactly_on_completion() -> Result<()> {
    let (coord, _dir) = open_coordinator().await?;
    let task = coord.create_task(TaskDraft::new("T-1", "a")).await?;
    assert!(task.completed_at.is_none());

    coord
        .transition("T-1", TaskStatus::InProgress, "operator", None)
        .await?;
    let task = coord.tasks.require("T-1").await?;
    assert!(task.completed_at.is_none(), "only Completed sets completed_at");

    let outcome = coord
        .transition("T-1", TaskStatus::Completed, "operator", None)
        .await?;
    assert!(outcome.task.completed_at.is_some());
    Ok(())
}

#[tokio::test]
async fn test_cancellation_requires_a_reason() -> Result<()> {
    let (coord, _dir) = open_coordinator().await?;
    coord.create_task(TaskDraft::new("T-1", "a")).await?;

    for bad in [None, Some("   ")] {
        let err = coord
            .transition("T-1", TaskStatus::Cancelled, "operator", bad)
            .await
            .expect_err("empty reason must be rejected");
        assert!(matches!(err, CoordError::Validation(_)));
    }

    coord
        .transition("T-1", TaskStatus::Cancelled, "operator", Some("descoped"))
        .await?;
    let trail = coord.audit_trail("T-1").await?;
    let last = trail.last().expect("audit entry");
    assert_eq!(last.to_status, "cancelled");
    assert_eq!(last.message.as_deref(), Some("descoped"));
    Ok(())
}

#[tokio::test]
async fn test_terminal_states_reject_further_transitions() -> Result<()> {
    let (coord, _dir) = open_coordinator().await?;
    coord.create_task(TaskDraft::new("T-1", "a")).await?;
    coord
        .transition("T-1", TaskStatus::Cancelled, "operator", Some("nope"))
        .await?;
    let err = coord
        .transition("T-1", TaskStatus::InProgress, "operator", None)
        .await
        .expect_err("cancelled is terminal");
    assert!(matches!(err, CoordError::Validation(_)));
    Ok(())
}

#[tokio::test]
async fn test_pending_cannot_jump_to_completed() -> Result<()> {
    let (coord, _dir) = open_coordinator().await?;
    coord.create_task(TaskDraft::new("T-1", "a")).await?;
    let err = coord
        .transition("T-1", TaskStatus::Completed, "operator", None)
        .await
        .expect_err("no shortcut to completed");
    assert!(matches!(err, CoordError::Validation(_)));
    Ok(())
}

#[tokio::test]
async fn test_every_transition_is_audited() -> Result<()> {
    let (coord, _dir) = open_coordinator().await?;
    coord.create_task(TaskDraft::new("T-1", "a")).await?;
    coord
        .transition("T-1", TaskStatus::InProgress, "operator", None)
        .await?;
    coord
        .transition("T-1", TaskStatus::Review, "agent-1", Some("ready for review"))
        .await?;
    coord
        .transition("T-1", TaskStatus::Completed, "operator", None)
        .await?;

    let trail = coord.audit_trail("T-1").await?;
    let transitions: Vec<(Option<String>, String)> = trail
        .iter()
        .map(|e| (e.from_status.clone(), e.to_status.clone()))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (None, "pending".to_string()),
            (Some("pending".into()), "in_progress".to_string()),
            (Some("in_progress".into()), "review".to_string()),
            (Some("review".into()), "completed".to_string()),
        ]
    );
    assert_eq!(trail[2].actor, "agent-1");
    Ok(())
}

#[tokio::test]
async fn test_completing_an_assigned_task_idles_the_agent() -> Result<()> {
    let (coord, _dir) = open_coordinator().await?;
    coord.create_task(TaskDraft::new("T-1", "a")).await?;
    coord.create_agent("agent-1", "one", &[]).await?;
    coord.sync("agent-1", "T-1").await?;

    coord
        .transition("T-1", TaskStatus::Completed, "agent-1", None)
        .await?;
    let agent = coord.agents.require("agent-1").await?;
    assert_eq!(agent.status, AgentStatus::Idle);
    assert!(agent.current_task.is_none());
    assert_eq!(agent.completed_count, 1);

    let task = coord.tasks.require("T-1").await?;
    assert!(task.assigned_agent.is_none(), "completed tasks hold no agent");
    Ok(())
}

// ─── Criteria policy gate ────────────────────────────────────────────────────

#[tokio::test]
async fn test_criteria_are_advisory_by_default() -> Result<()> {
    let (coord, _dir) = open_coordinator().await?;
    coord.create_task(TaskDraft::new("T-1", "a")).await?;
    coord.add_criterion("T-1", "write docs").await?;
    coord
        .transition("T-1", TaskStatus::InProgress, "operator", None)
        .await?;
    // Unchecked criterion does not block completion.
    coord
        .transition("T-1", TaskStatus::Completed, "operator", None)
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_criteria_gate_blocks_completion_when_enabled() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = CoordConfig::default();
    config.store.data_dir = dir.path().join("store");
    config.policy.require_criteria_complete = true;
    let coord = Coordinator::open(config).await?;

    coord.create_task(TaskDraft::new("T-1", "a")).await?;
    coord.add_criterion("T-1", "write docs").await?;
    coord.add_criterion("T-1", "add tests").await?;
    coord
        .transition("T-1", TaskStatus::InProgress, "operator", None)
        .await?;

    let err = coord
        .transition("T-1", TaskStatus::Completed, "operator", None)
        .await
        .expect_err("gate is on");
    assert!(matches!(err, CoordError::Validation(_)));

    coord.check_criterion("T-1", 1).await?;
    coord.check_criterion("T-1", 2).await?;
    assert_eq!(coord.completion_ratio("T-1").await?, 1.0);
    coord
        .transition("T-1", TaskStatus::Completed, "operator", None)
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_completion_ratio_checks_and_unchecks() -> Result<()> {
    let (coord, _dir) = open_coordinator().await?;
    coord.create_task(TaskDraft::new("T-1", "a")).await?;
    assert_eq!(coord.completion_ratio("T-1").await?, 0.0, "no criteria = 0");

    coord.add_criterion("T-1", "one").await?;
    coord.add_criterion("T-1", "two").await?;
    coord.check_criterion("T-1", 1).await?;
    assert_eq!(coord.completion_ratio("T-1").await?, 0.5);

    coord.uncheck_criterion("T-1", 1).await?;
    assert_eq!(coord.completion_ratio("T-1").await?, 0.0);

    let err = coord
        .check_criterion("T-1", 99)
        .await
        .expect_err("unknown position");
    assert!(matches!(err, CoordError::NotFound { .. }));
    Ok(())
}
