//! # Durable Local Store
//!
//! Crash-safe, partitioned persistence on SQLite. Every partition
//! (`api_cache`, `outbox`, `conflicts`, `local_data`, `dead_letters`) exposes
//! the same primitives:
//!
//! - `put` - idempotent upsert keyed by record id, atomic per call
//! - `get`, `get_all`, `get_by_index` - reads without side effects
//! - `delete` - no-op when the record is absent
//! - `clear` - explicit reset only
//!
//! Operation failures are returned to the caller, who decides whether to
//! retry. A failure to open the store surfaces as
//! [`StoreError::Unavailable`], which callers treat as "offline capability
//! unavailable".
//!
//! ## Usage
//!
//! ```rust,no_run
//! use reliefsync::client::local_store::LocalStore;
//! use reliefsync::shared::model::LocalEntity;
//!
//! # async fn example() -> Result<(), reliefsync::shared::error::StoreError> {
//! let store = LocalStore::open("/var/lib/reliefsync/local.db").await?;
//! store.put(&LocalEntity::provisional("needs", "local-1", serde_json::json!({}))).await?;
//! let needs: Vec<LocalEntity> = store
//!     .get_by_index("entity_type", &serde_json::json!("needs"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod records;
pub mod schema;
pub mod sync_meta;

pub use records::{Partition, StoreRecord};

use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use crate::shared::error::StoreError;
use crate::shared::model::{CachedResponse, LocalEntity};

/// Result type for local store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Local store connection manager
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    /// Open or create the store at `path`
    ///
    /// Creates the database file and parent directory if missing. Uses WAL
    /// mode so readers do not block the sync writer. Any failure is reported
    /// as [`StoreError::Unavailable`].
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Self::connect(path)
            .await
            .map_err(|e| StoreError::unavailable(format!("{}: {}", path.display(), e)))
    }

    async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::unavailable(e.to_string()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;

        tracing::info!("[Store] Opened local store at {}", path.display());
        Ok(store)
    }

    /// Open a private in-memory store
    ///
    /// A single connection is kept alive for the lifetime of the pool so the
    /// database is not discarded between queries.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::unavailable(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Initialize database schema
    async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(schema::SCHEMA).execute(&self.pool).await?;
        self.run_migrations().await
    }

    /// Run database migrations
    ///
    /// Checks the current schema version and records any pending migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version: (i32,) =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await?;

        if !schema::needs_migration(current_version.0) {
            return Ok(());
        }

        for version in schema::get_pending_migrations(current_version.0) {
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
                .bind(version)
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
            tracing::debug!("[Store] Applied schema migration {}", version);
        }

        Ok(())
    }

    /// Get connection pool reference
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent upsert keyed by the record's id
    pub async fn put<R: StoreRecord>(&self, record: &R) -> Result<()> {
        let body = serde_json::to_string(record)?;

        sqlx::query(
            "INSERT INTO records (partition, id, body, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(partition, id) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at",
        )
        .bind(R::PARTITION.as_str())
        .bind(record.record_key())
        .bind(body)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch one record by id
    pub async fn get<R: StoreRecord>(&self, id: &str) -> Result<Option<R>> {
        let row = sqlx::query("SELECT body FROM records WHERE partition = ? AND id = ?")
            .bind(R::PARTITION.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Self::decode(&row)?)),
            None => Ok(None),
        }
    }

    /// All records of a partition, in insertion order
    pub async fn get_all<R: StoreRecord>(&self) -> Result<Vec<R>> {
        let rows = sqlx::query("SELECT body FROM records WHERE partition = ? ORDER BY rowid ASC")
            .bind(R::PARTITION.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::decode).collect()
    }

    /// Records whose top-level `field` equals `value`
    pub async fn get_by_index<R: StoreRecord>(&self, field: &str, value: &Value) -> Result<Vec<R>> {
        if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::InvalidIndexField(field.to_string()));
        }
        let json_path = format!("$.{}", field);

        let rows = if value.is_null() {
            sqlx::query(
                "SELECT body FROM records
                 WHERE partition = ? AND json_extract(body, ?) IS NULL
                 ORDER BY rowid ASC",
            )
            .bind(R::PARTITION.as_str())
            .bind(json_path)
            .fetch_all(&self.pool)
            .await?
        } else {
            let query = sqlx::query(
                "SELECT body FROM records
                 WHERE partition = ? AND json_extract(body, ?) = ?
                 ORDER BY rowid ASC",
            )
            .bind(R::PARTITION.as_str())
            .bind(json_path);

            let query = match value {
                Value::String(s) => query.bind(s.clone()),
                Value::Bool(b) => query.bind(i64::from(*b)),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => query.bind(i),
                    None => query.bind(n.as_f64().unwrap_or_default()),
                },
                other => query.bind(other.to_string()),
            };

            query.fetch_all(&self.pool).await?
        };

        rows.iter().map(Self::decode).collect()
    }

    /// Delete by id; returns whether a record was removed
    pub async fn delete<R: StoreRecord>(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM records WHERE partition = ? AND id = ?")
            .bind(R::PARTITION.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove every record of a partition (explicit reset only)
    pub async fn clear<R: StoreRecord>(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM records WHERE partition = ?")
            .bind(R::PARTITION.as_str())
            .execute(&self.pool)
            .await?;

        tracing::warn!(
            "[Store] Cleared partition {} ({} records)",
            R::PARTITION.as_str(),
            result.rows_affected()
        );
        Ok(result.rows_affected())
    }

    /// Number of records in a partition
    pub async fn count<R: StoreRecord>(&self) -> Result<u64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records WHERE partition = ?")
            .bind(R::PARTITION.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(count.0 as u64)
    }

    /// Allocate the next id of a monotonic per-partition sequence
    ///
    /// Ids are never reused, even after the records holding them are deleted.
    pub async fn next_sequence(&self, partition: Partition) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO sequences (partition, value) VALUES (?, 1)
             ON CONFLICT(partition) DO UPDATE SET value = value + 1
             RETURNING value",
        )
        .bind(partition.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("value")?)
    }

    /// Get database statistics
    pub async fn get_stats(&self) -> Result<StoreStats> {
        let rows = sqlx::query("SELECT partition, COUNT(*) AS n FROM records GROUP BY partition")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = StoreStats::default();
        for row in rows {
            let partition: String = row.try_get("partition")?;
            let count = row.try_get::<i64, _>("n")? as u64;
            match Partition::from_name(&partition) {
                Some(Partition::ApiCache) => stats.cached_responses = count,
                Some(Partition::Outbox) => stats.pending_actions = count,
                Some(Partition::Conflicts) => stats.conflicts = count,
                Some(Partition::LocalData) => stats.local_entities = count,
                Some(Partition::DeadLetters) => stats.dead_letters = count,
                None => {}
            }
        }

        Ok(stats)
    }

    /// Clean up old data
    ///
    /// Removes confirmed local entities not written for `days_old` days and
    /// cache entries older than `cache_ttl`. Provisional entities are never
    /// removed here.
    pub async fn cleanup(&self, days_old: i64, cache_ttl: Duration) -> Result<CleanupStats> {
        let now = Utc::now();
        let entity_cutoff = now - Duration::days(days_old);

        let mut stats = CleanupStats::default();

        for entity in self.get_all::<LocalEntity>().await? {
            if !entity.is_local_only && entity.written_at < entity_cutoff {
                self.delete::<LocalEntity>(&entity.key()).await?;
                stats.entities_removed += 1;
            }
        }

        for cached in self.get_all::<CachedResponse>().await? {
            if !cached.is_fresh_at(now, cache_ttl) {
                self.delete::<CachedResponse>(&cached.endpoint).await?;
                stats.cache_entries_removed += 1;
            }
        }

        tracing::info!(
            "[Store] Cleanup removed {} entities, {} cache entries",
            stats.entities_removed,
            stats.cache_entries_removed
        );
        Ok(stats)
    }

    fn decode<R: StoreRecord>(row: &sqlx::sqlite::SqliteRow) -> Result<R> {
        let body: String = row.try_get("body")?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// Per-partition record counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub cached_responses: u64,
    pub pending_actions: u64,
    pub conflicts: u64,
    pub local_entities: u64,
    pub dead_letters: u64,
}

/// Cleanup operation statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub entities_removed: u64,
    pub cache_entries_removed: u64,
}
