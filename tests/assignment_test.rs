//! Integration tests for agent assignment: the concurrent claim race,
//! release/pickup, heartbeats + reaping, and suggestion ranking.

use anyhow::Result;
use crewd::agents::AgentStatus;
use crewd::config::CoordConfig;
use crewd::error::CoordError;
use crewd::tasks::{TaskDraft, TaskStatus};
use crewd::Coordinator;

async fn open_coordinator() -> Result<(Coordinator, tempfile::TempDir)> {
    let dir = tempfile::tempdir()?;
    let mut config = CoordConfig::default();
    config.store.data_dir = dir.path().join("store");
    let coord = Coordinator::open(config).await?;
    Ok((coord, dir))
}

// ─── Claim race ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_sync_has_exactly_one_winner() -> Result<()> {
    let (coord, _dir) = open_coordinator().await?;
    coord.create_task(TaskDraft::new("T-1", "contested")).await?;
    coord.create_agent("agent-1", "one", &[]).await?;
    coord.create_agent("agent-2", "two", &[]).await?;

    let (r1, r2) = tokio::join!(coord.sync("agent-1", "T-1"), coord.sync("agent-2", "T-1"));

    let wins = [r1.is_ok(), r2.is_ok()].iter().filter(|w| **w).count();
    assert_eq!(wins, 1, "exactly one claim succeeds");

    let loser = if r1.is_err() { r1.unwrap_err() } else { r2.unwrap_err() };
    assert!(
        matches!(
            loser,
            CoordError::AlreadyAssigned { .. } | CoordError::AgentBusy { .. }
        ),
        "loser gets a typed conflict, got: {loser}"
    );

    let task = coord.tasks.require("T-1").await?;
    let holder = task.assigned_agent.expect("task has a holder");
    let working: Vec<String> = coord
        .agents
        .list()
        .await?
        .into_iter()
        .filter(|a| a.status == AgentStatus::Working)
        .map(|a| a.id)
        .collect();
    assert_eq!(working, vec![holder], "exactly one agent ended up working");
    Ok(())
}

#[tokio::test]
async fn test_busy_agent_cannot_take_a_second_task() -> Result<()> {
    let (coord, _dir) = open_coordinator().await?;
    coord.create_task(TaskDraft::new("T-1", "first")).await?;
    coord.create_task(TaskDraft::new("T-2", "second")).await?;
    coord.create_agent("agent-1", "one", &[]).await?;

    coord.sync("agent-1", "T-1").await?;
    let err = coord
        .sync("agent-1", "T-2")
        .await
        .expect_err("agent already holds T-1");
    assert!(
        matches!(err, CoordError::AgentBusy { ref task, .. } if task == "T-1"),
        "got: {err}"
    );

    // Re-syncing the existing pairing is idempotent.
    coord.sync("agent-1", "T-1").await?;
    Ok(())
}

#[tokio::test]
async fn test_release_leaves_task_in_progress_for_pickup() -> Result<()> {
    let (coord, _dir) = open_coordinator().await?;
    coord.create_task(TaskDraft::new("T-1", "handover")).await?;
    coord.create_agent("agent-1", "one", &[]).await?;
    coord.create_agent("agent-2", "two", &[]).await?;

    coord.sync("agent-1", "T-1").await?;
    let released = coord.release("agent-1").await?;
    assert_eq!(released.as_deref(), Some("T-1"));

    let task = coord.tasks.require("T-1").await?;
    assert_eq!(task.status, TaskStatus::InProgress, "release keeps the status");
    assert!(task.assigned_agent.is_none());
    assert_eq!(
        coord.agents.require("agent-1").await?.status,
        AgentStatus::Idle
    );

    // Releasing again is a no-op, and another agent can pick the task up.
    assert!(coord.release("agent-1").await?.is_none());
    let sync = coord.sync("agent-2", "T-1").await?;
    assert_eq!(sync.task.assigned_agent.as_deref(), Some("agent-2"));
    assert_eq!(sync.task.status, TaskStatus::InProgress);
    Ok(())
}

// ─── Heartbeats & reaping ────────────────────────────────────────────────────

#[tokio::test]
async fn test_stale_assignment_is_reaped_and_audited() -> Result<()> {
    let (coord, _dir) = open_coordinator().await?;
    coord.create_task(TaskDraft::new("T-1", "abandoned")).await?;
    coord.create_agent("agent-1", "one", &[]).await?;
    coord.sync("agent-1", "T-1").await?;

    // A negative timeout puts the cutoff in the future, so the fresh
    // heartbeat from sync already counts as stale.
    let reaped = coord.agents.reap_stale_assignments(-5).await?;
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].task_id, "T-1");

    let task = coord.tasks.require("T-1").await?;
    assert_eq!(task.status, TaskStatus::Blocked);
    assert!(task.assigned_agent.is_none());
    assert_eq!(
        coord.agents.require("agent-1").await?.status,
        AgentStatus::Blocked
    );

    let trail = coord.audit_trail("T-1").await?;
    assert_eq!(trail.last().unwrap().actor, "janitor");

    // A fresh heartbeat revives the reaped agent.
    coord.heartbeat("agent-1").await?;
    assert_eq!(
        coord.agents.require("agent-1").await?.status,
        AgentStatus::Idle
    );
    Ok(())
}

#[tokio::test]
async fn test_healthy_assignments_survive_the_reaper() -> Result<()> {
    let (coord, _dir) = open_coordinator().await?;
    coord.create_task(TaskDraft::new("T-1", "alive")).await?;
    coord.create_agent("agent-1", "one", &[]).await?;
    coord.sync("agent-1", "T-1").await?;
    coord.heartbeat("agent-1").await?;

    let reaped = coord.agents.reap_stale_assignments(3600).await?;
    assert!(reaped.is_empty(), "recent heartbeat must not be reaped");
    Ok(())
}

// ─── Suggestion ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_suggest_prefers_matching_tags_and_is_deterministic() -> Result<()> {
    let (coord, _dir) = open_coordinator().await?;
    let mut draft = TaskDraft::new("T-1", "payments webhook");
    draft.tags = vec!["rust".into(), "payments".into()];
    coord.create_task(draft).await?;

    coord
        .create_agent("agent-a", "specialist", &["rust".into(), "payments".into()])
        .await?;
    coord
        .create_agent("agent-b", "generalist", &["docs".into()])
        .await?;

    let first = coord.suggest("T-1").await?;
    assert_eq!(first.len(), 2, "all idle agents are ranked");
    assert_eq!(first[0].agent_id, "agent-a");

    let second = coord.suggest("T-1").await?;
    let order_a: Vec<&str> = first.iter().map(|s| s.agent_id.as_str()).collect();
    let order_b: Vec<&str> = second.iter().map(|s| s.agent_id.as_str()).collect();
    assert_eq!(order_a, order_b, "unchanged state, identical ordering");
    Ok(())
}

#[tokio::test]
async fn test_suggest_returns_empty_when_nobody_is_idle() -> Result<()> {
    let (coord, _dir) = open_coordinator().await?;
    coord.create_task(TaskDraft::new("T-1", "a")).await?;
    coord.create_task(TaskDraft::new("T-2", "b")).await?;
    coord.create_agent("agent-1", "one", &[]).await?;
    coord.sync("agent-1", "T-1").await?;

    let suggestions = coord.suggest("T-2").await?;
    assert!(suggestions.is_empty(), "empty list, not an error");
    Ok(())
}
