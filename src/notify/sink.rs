// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use tracing::info;

use crate::error::CoordResult;
use crate::notify::model::Notification;

/// Actual delivery is an external collaborator. Implementations surface
/// `CoordError::SinkUnavailable` on failure; the engine logs and swallows it.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, note: &Notification) -> CoordResult<()>;
}

/// Default sink: structured log lines only. Useful headless and in tests.
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn deliver(&self, note: &Notification) -> CoordResult<()> {
        info!(title = %note.title, body = %note.body, sound = note.sound, "notification");
        Ok(())
    }
}
