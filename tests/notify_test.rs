//! Integration tests for the notification engine: filtering, rate-limit
//! windows, milestone exactly-once firing, and sink failure isolation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use crewd::config::NotificationConfig;
use crewd::error::{CoordError, CoordResult};
use crewd::notify::{
    DispatchOutcome, Notification, NotificationEngine, NotificationSink, NotifyEvent, NotifyKind,
    SuppressReason,
};
use crewd::tasks::{Priority, ProgressSummary};

// ─── Test sinks ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingSink {
    delivered: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    fn titles(&self) -> Vec<String> {
        self.delivered.lock().unwrap().iter().map(|n| n.title.clone()).collect()
    }
    fn count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, note: &Notification) -> CoordResult<()> {
        self.delivered.lock().unwrap().push(note.clone());
        Ok(())
    }
}

struct FailingSink;

#[async_trait]
impl NotificationSink for FailingSink {
    async fn deliver(&self, _note: &Notification) -> CoordResult<()> {
        Err(CoordError::SinkUnavailable("desktop bridge is down".into()))
    }
}

fn engine_with(config: NotificationConfig) -> (NotificationEngine, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    (NotificationEngine::new(config, sink.clone()), sink)
}

fn error_event(agent: &str) -> NotifyEvent {
    NotifyEvent::agent_error(agent, "compile failed")
}

fn complete_event(agent: &str) -> NotifyEvent {
    NotifyEvent::task_complete("T-1", "some task", agent)
}

fn progress(completed: i64, total: i64) -> ProgressSummary {
    ProgressSummary {
        total,
        completed,
        ..Default::default()
    }
}

// ─── Filtering & rate limiting ───────────────────────────────────────────────

#[tokio::test]
async fn test_config_scenario_kind_filter_and_window() {
    // enabled, events: [agent_error], rate limit 60s.
    let config = NotificationConfig {
        kinds: vec![NotifyKind::AgentError],
        rate_limit_secs: 60,
        ..Default::default()
    };
    let (engine, sink) = engine_with(config);
    let t0 = Utc::now();

    // Two "complete" events: kind not allowed, zero dispatches.
    for _ in 0..2 {
        let out = engine.notify_at(&complete_event("agent-1"), t0).await;
        assert_eq!(out, DispatchOutcome::Suppressed(SuppressReason::KindFiltered));
    }
    assert_eq!(sink.count(), 0);

    // Two error events 70 seconds apart dispatch twice.
    assert_eq!(
        engine.notify_at(&error_event("agent-1"), t0).await,
        DispatchOutcome::Dispatched
    );
    assert_eq!(
        engine
            .notify_at(&error_event("agent-1"), t0 + Duration::seconds(70))
            .await,
        DispatchOutcome::Dispatched
    );
    assert_eq!(sink.count(), 2);

    // A third error 5 seconds later is inside the window and drops.
    assert_eq!(
        engine
            .notify_at(&error_event("agent-1"), t0 + Duration::seconds(75))
            .await,
        DispatchOutcome::Suppressed(SuppressReason::RateLimited)
    );
    assert_eq!(sink.count(), 2);
}

#[tokio::test]
async fn test_rate_limit_is_keyed_per_agent_and_kind() {
    let (engine, sink) = engine_with(NotificationConfig::default());
    let t0 = Utc::now();

    assert_eq!(
        engine.notify_at(&error_event("agent-1"), t0).await,
        DispatchOutcome::Dispatched
    );
    // Same window, different agent: independent key.
    assert_eq!(
        engine.notify_at(&error_event("agent-2"), t0).await,
        DispatchOutcome::Dispatched
    );
    // Same agent, different kind: independent key.
    assert_eq!(
        engine.notify_at(&complete_event("agent-1"), t0).await,
        DispatchOutcome::Dispatched
    );
    // Same agent, same kind: limited.
    assert_eq!(
        engine.notify_at(&error_event("agent-1"), t0).await,
        DispatchOutcome::Suppressed(SuppressReason::RateLimited)
    );
    assert_eq!(sink.count(), 3);
}

#[tokio::test]
async fn test_disabled_engine_drops_everything_silently() {
    let config = NotificationConfig {
        enabled: false,
        ..Default::default()
    };
    let (engine, sink) = engine_with(config);
    let out = engine.notify(&error_event("agent-1")).await;
    assert_eq!(out, DispatchOutcome::Suppressed(SuppressReason::Disabled));
    assert_eq!(sink.count(), 0);
}

#[tokio::test]
async fn test_min_priority_filters_low_events() {
    let config = NotificationConfig {
        min_priority: Priority::High,
        ..Default::default()
    };
    let (engine, sink) = engine_with(config);

    // task_complete is Medium priority — below the bar.
    assert_eq!(
        engine.notify(&complete_event("agent-1")).await,
        DispatchOutcome::Suppressed(SuppressReason::BelowMinPriority)
    );
    // agent_error is High — passes.
    assert_eq!(
        engine.notify(&error_event("agent-1")).await,
        DispatchOutcome::Dispatched
    );
    assert_eq!(sink.count(), 1);
}

#[tokio::test]
async fn test_sink_failure_is_swallowed() {
    let engine = NotificationEngine::new(NotificationConfig::default(), Arc::new(FailingSink));
    // No panic, no Err — just a reported outcome.
    assert_eq!(
        engine.notify(&error_event("agent-1")).await,
        DispatchOutcome::SinkFailed
    );
}

// ─── Milestones ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_milestones_fire_exactly_once_in_ascending_order() {
    let (engine, sink) = engine_with(NotificationConfig::default());
    let now = Utc::now();

    // 0% → nothing.
    assert!(engine.check_progress_at(&progress(0, 10), now).await.is_empty());

    // 30%: crosses 25 only.
    let fired: Vec<u8> = engine
        .check_progress_at(&progress(3, 10), now)
        .await
        .into_iter()
        .map(|(t, _)| t)
        .collect();
    assert_eq!(fired, vec![25]);

    // Same progress again: nothing new.
    assert!(engine.check_progress_at(&progress(3, 10), now).await.is_empty());

    // Jump straight to 100%: the remaining thresholds fire ascending.
    let fired: Vec<u8> = engine
        .check_progress_at(&progress(10, 10), now)
        .await
        .into_iter()
        .map(|(t, _)| t)
        .collect();
    assert_eq!(fired, vec![50, 75, 100]);

    // Exactly one delivery per configured threshold, ascending titles.
    assert_eq!(sink.count(), 4);
    let titles = sink.titles();
    assert!(titles[0].starts_with("25%"), "got: {titles:?}");
    assert!(titles[3].starts_with("100%"));

    // And never again.
    assert!(engine.check_progress_at(&progress(10, 10), now).await.is_empty());
}

#[tokio::test]
async fn test_two_thresholds_in_one_mutation_both_deliver() {
    let config = NotificationConfig {
        rate_limit_secs: 3600,
        ..Default::default()
    };
    let (engine, sink) = engine_with(config);
    let now = Utc::now();

    // 60% crosses 25 and 50 at the same instant; the rate-limit window must
    // not swallow the second one.
    let fired: Vec<u8> = engine
        .check_progress_at(&progress(6, 10), now)
        .await
        .into_iter()
        .map(|(t, _)| t)
        .collect();
    assert_eq!(fired, vec![25, 50]);
    assert_eq!(sink.count(), 2);
}
