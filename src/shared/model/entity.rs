//! # Local Entities
//!
//! The client's working copy of a domain record. There is at most one entity
//! per `(entity_type, id)`; the last writer (local mutation or server fetch)
//! takes the slot unless a conflict resolution merges it.
//!
//! Entities written optimistically carry `is_local_only = true` until the
//! server confirms them, so merge/replace logic never has to guess from the
//! payload shape whether a record is provisional.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Working copy of one domain record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntity {
    pub id: String,
    pub entity_type: String,
    pub payload: Value,
    /// Last time the slot was written
    pub written_at: DateTime<Utc>,
    /// Written optimistically and not yet confirmed by the server
    #[serde(default)]
    pub is_local_only: bool,
    /// When the server last confirmed this record
    #[serde(default)]
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Set when the payload is the product of a conflict merge
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    /// Strategy that produced the merge
    #[serde(default)]
    pub merge_strategy: Option<String>,
}

impl LocalEntity {
    /// Storage key for an entity
    pub fn key_for(entity_type: &str, id: &str) -> String {
        format!("{}:{}", entity_type, id)
    }

    /// Optimistic entity written before server confirmation
    pub fn provisional(entity_type: impl Into<String>, id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            payload,
            written_at: Utc::now(),
            is_local_only: true,
            confirmed_at: None,
            merged_at: None,
            merge_strategy: None,
        }
    }

    /// Entity as confirmed by a server response
    pub fn confirmed(entity_type: impl Into<String>, id: impl Into<String>, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            payload,
            written_at: now,
            is_local_only: false,
            confirmed_at: Some(now),
            merged_at: None,
            merge_strategy: None,
        }
    }

    /// Storage key of this entity
    pub fn key(&self) -> String {
        Self::key_for(&self.entity_type, &self.id)
    }

    /// Payload as returned to callers: object payloads get `id` and
    /// `is_local_only` stamped in so provisional results are recognisable.
    pub fn to_response_body(&self) -> Value {
        match &self.payload {
            Value::Object(map) => {
                let mut body = map.clone();
                body.entry("id").or_insert_with(|| Value::String(self.id.clone()));
                body.insert("is_local_only".to_string(), Value::Bool(self.is_local_only));
                Value::Object(body)
            }
            other => other.clone(),
        }
    }
}
