//! Resource path parsing.
//!
//! A target such as `/needs/42?expand=site` is read as entity type `needs`
//! and entity id `42`. Collection paths (`/needs`) have no id.

use serde::{Deserialize, Serialize};

/// Logical resource addressed by a request target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePath {
    /// First path segment
    pub entity_type: String,
    /// Second path segment, if any
    pub entity_id: Option<String>,
}

impl ResourcePath {
    /// Parse a target path. Returns `None` for an empty path.
    pub fn parse(target: &str) -> Option<Self> {
        let path = target.split(['?', '#']).next().unwrap_or_default();
        let mut segments = path.split('/').filter(|s| !s.is_empty());

        let entity_type = segments.next()?.to_string();
        let entity_id = segments.next().map(str::to_string);

        Some(Self {
            entity_type,
            entity_id,
        })
    }

    /// Whether the path addresses a whole collection
    pub fn is_collection(&self) -> bool {
        self.entity_id.is_none()
    }

    /// Storage key of the addressed entity, if the path names one
    pub fn entity_key(&self) -> Option<String> {
        self.entity_id
            .as_ref()
            .map(|id| format!("{}:{}", self.entity_type, id))
    }
}
