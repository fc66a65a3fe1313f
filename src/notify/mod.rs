// SPDX-License-Identifier: MIT
//! Notification engine — classification, rate limiting, milestones.
//!
//! One explicitly constructed instance per process: create at startup, pass
//! by value (`Arc`), discard at exit. Rate-limit and milestone state is
//! in-memory only; a second instance of the core enforces its own
//! independent limits, and milestone state deliberately resets on restart.
//!
//! Delivery is strictly best-effort. A failing sink can never abort or fail
//! the task operation that triggered the event.

pub mod model;
pub mod sink;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::NotificationConfig;
use crate::tasks::model::ProgressSummary;

pub use model::{DispatchOutcome, Notification, NotifyEvent, NotifyKind, SuppressReason};
pub use sink::{NotificationSink, TracingSink};

pub struct NotificationEngine {
    config: NotificationConfig,
    sink: Arc<dyn NotificationSink>,
    /// (agent, kind) → last successful dispatch.
    last_fired: Mutex<HashMap<(String, NotifyKind), DateTime<Utc>>>,
    /// Milestone thresholds already fired this process lifetime.
    fired_milestones: Mutex<BTreeSet<u8>>,
}

impl NotificationEngine {
    pub fn new(config: NotificationConfig, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            config,
            sink,
            last_fired: Mutex::new(HashMap::new()),
            fired_milestones: Mutex::new(BTreeSet::new()),
        }
    }

    /// Offer an event for dispatch.
    pub async fn notify(&self, event: &NotifyEvent) -> DispatchOutcome {
        self.notify_at(event, Utc::now()).await
    }

    /// Clock-injected variant so rate-limit windows are testable without
    /// sleeping.
    pub async fn notify_at(&self, event: &NotifyEvent, now: DateTime<Utc>) -> DispatchOutcome {
        if !self.config.enabled {
            return DispatchOutcome::Suppressed(SuppressReason::Disabled);
        }
        if !self.config.kinds.contains(&event.kind) {
            return DispatchOutcome::Suppressed(SuppressReason::KindFiltered);
        }
        if event.priority < self.config.min_priority {
            return DispatchOutcome::Suppressed(SuppressReason::BelowMinPriority);
        }

        // The lock spans check-through-dispatch so two concurrent events in
        // the same window cannot both pass the check.
        let mut last_fired = self.last_fired.lock().await;

        // Milestones skip the window: their dedup is the fired-threshold set,
        // and two thresholds crossed by one mutation must both deliver.
        if event.kind != NotifyKind::Milestone {
            let key = (event.agent_id.clone(), event.kind);
            if let Some(last) = last_fired.get(&key) {
                if now - *last < Duration::seconds(self.config.rate_limit_secs) {
                    return DispatchOutcome::Suppressed(SuppressReason::RateLimited);
                }
            }
        }

        let note = Notification {
            title: event.title.clone(),
            body: event.body.clone(),
            sound: self.config.sound,
        };
        match self.sink.deliver(&note).await {
            Ok(()) => {
                last_fired.insert((event.agent_id.clone(), event.kind), now);
                DispatchOutcome::Dispatched
            }
            Err(e) => {
                warn!(kind = %event.kind, err = %e, "notification sink failed; dropping");
                DispatchOutcome::SinkFailed
            }
        }
    }

    /// Fire any milestone thresholds newly crossed by the given progress,
    /// ascending, each at most once per process lifetime.
    pub async fn check_progress(&self, progress: &ProgressSummary) -> Vec<(u8, DispatchOutcome)> {
        self.check_progress_at(progress, Utc::now()).await
    }

    pub async fn check_progress_at(
        &self,
        progress: &ProgressSummary,
        now: DateTime<Utc>,
    ) -> Vec<(u8, DispatchOutcome)> {
        let percent = progress.percent_complete();
        let mut thresholds = self.config.milestones.clone();
        thresholds.sort_unstable();

        let mut fired = self.fired_milestones.lock().await;
        let mut out = Vec::new();
        for t in thresholds {
            if fired.contains(&t) || percent < t as f64 {
                continue;
            }
            fired.insert(t);
            let event = NotifyEvent::milestone(t, progress.completed, progress.total);
            out.push((t, self.notify_at(&event, now).await));
        }
        out
    }
}
