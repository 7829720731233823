//! Memoized GET responses.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cached response for one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Request target the response was fetched from
    pub endpoint: String,
    pub payload: Value,
    pub fetched_at: DateTime<Utc>,
}

impl CachedResponse {
    pub fn new(endpoint: impl Into<String>, payload: Value) -> Self {
        Self {
            endpoint: endpoint.into(),
            payload,
            fetched_at: Utc::now(),
        }
    }

    /// Valid only while `now - fetched_at < ttl`. Stale entries are kept in
    /// the store but treated as misses.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.signed_duration_since(self.fetched_at) < ttl
    }
}
