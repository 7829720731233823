//! Conflict records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Outcome of a conflict resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionKind {
    Local,
    Server,
    Merge,
    /// Pending human decision
    Manual,
}

impl ResolutionKind {
    /// Terminal outcomes are never re-opened
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResolutionKind::Manual)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionKind::Local => "local",
            ResolutionKind::Server => "server",
            ResolutionKind::Merge => "merge",
            ResolutionKind::Manual => "manual",
        }
    }
}

impl fmt::Display for ResolutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable note that local and server copies of an entity diverged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    pub entity_id: String,
    pub entity_type: String,
    pub local_payload: Value,
    pub server_payload: Value,
    pub resolution: ResolutionKind,
    /// Name of the policy that produced `resolution`
    pub strategy: String,
    pub detected_at: DateTime<Utc>,
    /// `None` while the record is pending (`manual`)
    pub resolved_at: Option<DateTime<Utc>>,
    pub merged_payload: Option<Value>,
}

impl ConflictRecord {
    /// Whether the record still waits for a human decision
    pub fn is_pending(&self) -> bool {
        self.resolution == ResolutionKind::Manual
    }
}
