//! Coordinator configuration (`crewd.toml`).
//!
//! Every section is optional; missing keys fall back to the per-section
//! `Default` impls so a zero-byte file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CoordError, CoordResult};
use crate::notify::model::NotifyKind;
use crate::tasks::model::Priority;

const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HEARTBEAT_TIMEOUT_SECS: i64 = 90;
const DEFAULT_RATE_LIMIT_SECS: i64 = 60;

// ─── StoreConfig ─────────────────────────────────────────────────────────────

/// Embedded store configuration (`[store]`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding `crewd.db`. Created on first open.
    pub data_dir: PathBuf,
    /// Individual queries exceeding this bound fail with `StoreUnavailable`.
    pub query_timeout_secs: u64,
    /// Working agents silent for longer than this are considered stale and
    /// eligible for `reap_stale_assignments`.
    pub heartbeat_timeout_secs: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./crewd-data"),
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            heartbeat_timeout_secs: DEFAULT_HEARTBEAT_TIMEOUT_SECS,
        }
    }
}

// ─── NotificationConfig ──────────────────────────────────────────────────────

/// Notification engine configuration (`[notifications]`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    /// Event kinds that may dispatch. Kinds outside this set drop silently.
    pub kinds: Vec<NotifyKind>,
    /// Ask the sink to play a sound with each delivery.
    pub sound: bool,
    /// Events below this priority drop silently.
    pub min_priority: Priority,
    /// Minimum seconds between two dispatches for the same (agent, kind).
    pub rate_limit_secs: i64,
    /// Overall-progress percentages that fire a one-time milestone event.
    /// Must be ascending; fired state is process-local and resets on restart.
    pub milestones: Vec<u8>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kinds: vec![
                NotifyKind::TaskComplete,
                NotifyKind::AgentError,
                NotifyKind::Milestone,
            ],
            sound: false,
            min_priority: Priority::Low,
            rate_limit_secs: DEFAULT_RATE_LIMIT_SECS,
            milestones: vec![25, 50, 75, 100],
        }
    }
}

// ─── PolicyConfig ────────────────────────────────────────────────────────────

/// Lifecycle policy knobs (`[policy]`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// When true, a task cannot transition to Completed while any acceptance
    /// criterion is unchecked. Off by default — criteria are advisory.
    pub require_criteria_complete: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            require_criteria_complete: false,
        }
    }
}

// ─── CoordConfig ─────────────────────────────────────────────────────────────

/// Root configuration for a coordinator instance.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordConfig {
    pub store: StoreConfig,
    pub notifications: NotificationConfig,
    pub policy: PolicyConfig,
}

impl CoordConfig {
    /// Load configuration from a TOML file. A missing file yields defaults;
    /// a present-but-invalid file is a hard error.
    pub async fn load(path: &Path) -> CoordResult<Self> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(CoordError::Validation(format!(
                    "cannot read config {}: {e}",
                    path.display()
                )))
            }
        };
        toml::from_str(&raw)
            .map_err(|e| CoordError::Validation(format!("invalid config: {e}")))
    }
}
