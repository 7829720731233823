//! # Queued Actions
//!
//! A `QueuedAction` is one deferred write. It is created when a write cannot
//! reach the server, read by the sync orchestrator, and deleted either on
//! successful replay or on retry exhaustion. Apart from `retry_count` an
//! action is never modified after creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::shared::error::SyncError;

/// Namespace for idempotency keys (UUIDv5)
const IDEMPOTENCY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a8e_4d3b_5e71_9a0c_3b5d_8e2f_1a47);

/// HTTP method of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Canonical upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Whether the method mutates server state
    pub fn is_write(&self) -> bool {
        !matches!(self, HttpMethod::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(SyncError::validation(
                "method",
                format!("unsupported HTTP method '{}'", other),
            )),
        }
    }
}

/// Logical kind of a deferred write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

impl ActionKind {
    /// Kind implied by a write method. `None` for reads.
    pub fn for_method(method: HttpMethod) -> Option<Self> {
        match method {
            HttpMethod::Post => Some(ActionKind::Create),
            HttpMethod::Put | HttpMethod::Patch => Some(ActionKind::Update),
            HttpMethod::Delete => Some(ActionKind::Delete),
            HttpMethod::Get => None,
        }
    }
}

/// One deferred write operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    /// Store-assigned, monotonic id
    pub id: i64,
    /// Create / update / delete
    pub kind: ActionKind,
    /// Logical resource path, e.g. `/needs/42`
    pub target: String,
    /// HTTP method to replay with
    pub method: HttpMethod,
    /// Request body (`Null` when the write has none)
    pub payload: Value,
    /// When the action was queued
    pub enqueued_at: DateTime<Utc>,
    /// Failed delivery attempts so far
    pub retry_count: u32,
    /// Attempts allowed before the action is dropped
    pub max_retries: u32,
    /// Entity type the target belongs to
    pub entity_type: String,
    /// Ordering key; replay is FIFO per key
    pub entity_key: String,
    /// Id of the optimistic local entity written for this action
    pub local_entity_id: Option<String>,
    /// Sent as `Idempotency-Key` on every delivery attempt
    pub idempotency_key: Uuid,
}

impl QueuedAction {
    /// Deterministic idempotency key for a mutation
    pub fn idempotency_key_for(
        method: HttpMethod,
        target: &str,
        payload: &Value,
        enqueued_at: &DateTime<Utc>,
    ) -> Uuid {
        let material = format!(
            "{}\n{}\n{}\n{}",
            method,
            target,
            payload,
            enqueued_at.to_rfc3339()
        );
        Uuid::new_v5(&IDEMPOTENCY_NAMESPACE, material.as_bytes())
    }

    /// Whether the retry budget is used up
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Serialized payload size in bytes, used for sync budgeting
    pub fn estimated_size(&self) -> u64 {
        serde_json::to_vec(&self.payload)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0)
    }
}

/// Why an action left the outbox without being delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// `max_retries` delivery attempts failed
    RetriesExhausted,
    /// A conflict resolution made the write obsolete
    Superseded,
}

/// Durable record of an action that was dropped from the outbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Same as the dropped action's id
    pub id: String,
    pub action: QueuedAction,
    pub reason: DropReason,
    /// Error from the final delivery attempt
    pub last_error: Option<String>,
    pub dropped_at: DateTime<Utc>,
}
