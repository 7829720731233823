//! # Sync State
//!
//! Snapshot of the orchestrator, published on a `watch` channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::sync::network_monitor::NetworkStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Syncing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    /// End of the last completed cycle
    pub last_sync: Option<DateTime<Utc>>,
    pub pending_actions: u64,
    pub dead_letters: u64,
    /// Pending actions waiting out a retry delay
    pub backing_off: u64,
    /// Transfers behind the current bandwidth estimate
    pub bandwidth_samples: u64,
    pub network: NetworkStatus,
    /// Error of the last failed delivery, cleared by a clean cycle
    pub last_error: Option<String>,
}

impl SyncStatus {
    pub fn is_syncing(&self) -> bool {
        self.phase == SyncPhase::Syncing
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
            last_sync: None,
            pending_actions: 0,
            dead_letters: 0,
            backing_off: 0,
            bandwidth_samples: 0,
            network: NetworkStatus::Offline,
            last_error: None,
        }
    }
}
