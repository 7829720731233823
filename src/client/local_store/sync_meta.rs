//! # Sync Metadata Operations
//!
//! Key/value bookkeeping for the sync subsystem. The planner's
//! `min_interval_ms` is enforced from the per-entity-type `last_sync:<type>`
//! entries kept here.

use chrono::{DateTime, Utc};
use sqlx::Row;
use std::collections::HashMap;

use super::{LocalStore, Result};

const LAST_SYNC_PREFIX: &str = "last_sync:";

impl LocalStore {
    async fn set_sync_metadata(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_metadata (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record that `entity_type` was synced at `at`
    pub async fn set_last_synced_at(&self, entity_type: &str, at: DateTime<Utc>) -> Result<()> {
        let key = format!("{}{}", LAST_SYNC_PREFIX, entity_type);
        self.set_sync_metadata(&key, &at.to_rfc3339()).await
    }

    /// Last sync time of every entity type that has one
    ///
    /// Unparseable values are skipped.
    pub async fn last_synced_by_type(&self) -> Result<HashMap<String, DateTime<Utc>>> {
        let rows = sqlx::query("SELECT key, value FROM sync_metadata WHERE key LIKE ?")
            .bind(format!("{}%", LAST_SYNC_PREFIX))
            .fetch_all(&self.pool)
            .await?;

        let mut last_synced = HashMap::new();
        for row in rows {
            let key: String = row.try_get("key")?;
            let value: String = row.try_get("value")?;

            let Some(entity_type) = key.strip_prefix(LAST_SYNC_PREFIX) else {
                continue;
            };
            match DateTime::parse_from_rfc3339(&value) {
                Ok(at) => {
                    last_synced.insert(entity_type.to_string(), at.with_timezone(&Utc));
                }
                Err(e) => tracing::warn!("[Store] Ignoring bad sync timestamp for {}: {}", entity_type, e),
            }
        }

        Ok(last_synced)
    }
}
