//! # Background Mirror Queue
//!
//! Second, independent delivery path for writes issued outside the sync
//! layer (e.g. by a host process forwarding raw requests). Matching writes
//! are forwarded as-is; when the forward fails with a network error or a
//! 5xx, the serialized request is persisted to its own SQLite file and
//! replayed on the next connectivity restoration. Entries are removed after
//! a 2xx, or discarded with a warning when the server rejects them with a
//! non-transient 4xx; anything else keeps them for the next replay.
//!
//! The mirror never touches the local store. Both paths send the same
//! `Idempotency-Key` header so the server can deduplicate.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use tokio::task::JoinHandle;

use crate::client::sync::NetworkMonitor;
use crate::client::transport::{HttpBackend, HttpResponse, IDEMPOTENCY_HEADER};
use crate::shared::error::{StoreError, SyncError};
use crate::shared::event::{broadcast_event, SyncEvent, SyncEventBroadcast};
use crate::shared::model::{HttpMethod, QueuedAction};

type Result<T> = std::result::Result<T, SyncError>;

const MIRROR_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mirror_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body TEXT,
    idempotency_key TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    queued_at TEXT NOT NULL
);
"#;

/// A raw write as seen at the process boundary
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorRequest {
    pub method: HttpMethod,
    /// Absolute URL or a path on the configured server
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl MirrorRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Path component of the URL
    pub fn path(&self) -> String {
        match reqwest::Url::parse(&self.url) {
            Ok(url) => url.path().to_string(),
            Err(_) => self.url.clone(),
        }
    }

    /// Whether the mirror should intercept this request
    pub fn matches(&self, prefixes: &[String]) -> bool {
        let path = self.path();
        self.method.is_write() && prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    fn idempotency_header(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(IDEMPOTENCY_HEADER))
            .map(|(_, value)| value.as_str())
    }
}

/// A persisted mirror entry
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMirrorRequest {
    pub id: i64,
    pub request: MirrorRequest,
    pub idempotency_key: String,
    pub attempts: u32,
    pub queued_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct MirrorRow {
    id: i64,
    method: String,
    url: String,
    headers: String,
    body: Option<String>,
    idempotency_key: String,
    attempts: i64,
    queued_at: String,
}

impl TryFrom<MirrorRow> for QueuedMirrorRequest {
    type Error = SyncError;

    fn try_from(row: MirrorRow) -> Result<Self> {
        let headers: Vec<(String, String)> = serde_json::from_str(&row.headers)?;
        let queued_at = DateTime::parse_from_rfc3339(&row.queued_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| SyncError::validation("queued_at", e.to_string()))?;

        Ok(Self {
            id: row.id,
            request: MirrorRequest {
                method: HttpMethod::from_str(&row.method)?,
                url: row.url,
                headers,
                body: row.body,
            },
            idempotency_key: row.idempotency_key,
            attempts: row.attempts.max(0) as u32,
            queued_at,
        })
    }
}

/// What happened to an intercepted request
#[derive(Debug, Clone, PartialEq)]
pub enum InterceptOutcome {
    /// Not a mirrored request, or delivered; carries the server response
    Forwarded(HttpResponse),
    /// Delivery failed and the request was persisted
    Queued { id: i64 },
}

/// Result of one replay pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub replayed: usize,
    /// Rejected with a non-transient 4xx and removed
    pub discarded: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayOutcome {
    Delivered,
    Rejected,
    Retry,
}

/// Independent durable queue of raw writes
#[derive(Debug, Clone)]
pub struct MirrorQueue {
    pool: SqlitePool,
    backend: HttpBackend,
    events: SyncEventBroadcast,
    prefixes: Vec<String>,
}

impl MirrorQueue {
    /// Open or create the mirror database at `path`
    pub async fn open(
        path: impl AsRef<Path>,
        backend: HttpBackend,
        events: SyncEventBroadcast,
    ) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::unavailable(format!("{}: {}", parent.display(), e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::unavailable(format!("{}: {}", path.display(), e)))?;

        let queue = Self::with_pool(pool, backend, events).await?;
        tracing::info!("[Mirror] Opened mirror queue at {}", path.display());
        Ok(queue)
    }

    /// Open a private in-memory mirror queue
    pub async fn open_in_memory(backend: HttpBackend, events: SyncEventBroadcast) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(StoreError::from)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::unavailable(e.to_string()))?;

        Self::with_pool(pool, backend, events).await
    }

    async fn with_pool(pool: SqlitePool, backend: HttpBackend, events: SyncEventBroadcast) -> Result<Self> {
        sqlx::raw_sql(MIRROR_SCHEMA)
            .execute(&pool)
            .await
            .map_err(StoreError::from)?;

        let prefixes = backend.config().mirror_path_prefixes.clone();
        Ok(Self {
            pool,
            backend,
            events,
            prefixes,
        })
    }

    /// Forward a request, persisting it when delivery fails
    ///
    /// Requests that do not match the configured prefixes are forwarded
    /// without interception; their failures are returned to the caller.
    pub async fn intercept(&self, mut request: MirrorRequest) -> Result<InterceptOutcome> {
        if !request.matches(&self.prefixes) {
            let response = self
                .backend
                .send_raw(request.method, &request.url, &request.headers, request.body.as_deref())
                .await?;
            return Ok(InterceptOutcome::Forwarded(response));
        }

        let idempotency_key = match request.idempotency_header() {
            Some(key) => key.to_string(),
            None => {
                let key = mirror_idempotency_key(&request, &Utc::now());
                request.headers.push((IDEMPOTENCY_HEADER.to_string(), key.clone()));
                key
            }
        };

        let failure = match self
            .backend
            .send_raw(request.method, &request.url, &request.headers, request.body.as_deref())
            .await
        {
            Ok(response) if response.status < 500 => return Ok(InterceptOutcome::Forwarded(response)),
            Ok(response) => response.error_summary(),
            Err(e) => e.to_string(),
        };

        let id = self.persist(&request, &idempotency_key).await?;
        tracing::warn!(
            "[Mirror] {} {} failed ({}), queued as #{}",
            request.method,
            request.url,
            failure,
            id
        );
        broadcast_event(
            &self.events,
            SyncEvent::MirrorQueued {
                request_id: id,
                url: request.url.clone(),
            },
        );

        Ok(InterceptOutcome::Queued { id })
    }

    async fn persist(&self, request: &MirrorRequest, idempotency_key: &str) -> Result<i64> {
        let headers = serde_json::to_string(&request.headers)?;
        let result = sqlx::query(
            "INSERT INTO mirror_requests (method, url, headers, body, idempotency_key, attempts, queued_at)
             VALUES (?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(request.method.as_str())
        .bind(&request.url)
        .bind(headers)
        .bind(&request.body)
        .bind(idempotency_key)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(result.last_insert_rowid())
    }

    /// Persisted entries in queue order
    pub async fn pending(&self) -> Result<Vec<QueuedMirrorRequest>> {
        let rows: Vec<MirrorRow> = sqlx::query_as(
            "SELECT id, method, url, headers, body, idempotency_key, attempts, queued_at
             FROM mirror_requests ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        rows.into_iter().map(QueuedMirrorRequest::try_from).collect()
    }

    pub async fn count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM mirror_requests")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(count.max(0) as u64)
    }

    /// Re-issue every persisted entry once
    ///
    /// A 2xx removes the entry and a non-transient 4xx discards it; any other
    /// outcome keeps it and bumps its attempt counter. Emits
    /// `MirrorReplayComplete`.
    pub async fn replay(&self) -> Result<ReplaySummary> {
        let entries = self.pending().await?;
        let mut summary = ReplaySummary::default();

        for entry in entries {
            let request = &entry.request;
            let outcome = match self
                .backend
                .send_raw(request.method, &request.url, &request.headers, request.body.as_deref())
                .await
            {
                Ok(response) if response.is_success() => ReplayOutcome::Delivered,
                Ok(response) if response.status >= 400 && !response.is_transient_failure() => {
                    tracing::warn!(
                        "[Mirror] Discarding #{} {} {} after {} attempt(s): {}",
                        entry.id,
                        request.method,
                        request.url,
                        entry.attempts + 1,
                        response.error_summary()
                    );
                    ReplayOutcome::Rejected
                }
                Ok(response) => {
                    tracing::warn!("[Mirror] Replay of #{} failed: {}", entry.id, response.error_summary());
                    ReplayOutcome::Retry
                }
                Err(e) => {
                    tracing::warn!("[Mirror] Replay of #{} failed: {}", entry.id, e);
                    ReplayOutcome::Retry
                }
            };

            if outcome != ReplayOutcome::Retry {
                sqlx::query("DELETE FROM mirror_requests WHERE id = ?")
                    .bind(entry.id)
                    .execute(&self.pool)
                    .await
                    .map_err(StoreError::from)?;
                match outcome {
                    ReplayOutcome::Delivered => summary.replayed += 1,
                    _ => summary.discarded += 1,
                }
            } else {
                sqlx::query("UPDATE mirror_requests SET attempts = attempts + 1 WHERE id = ?")
                    .bind(entry.id)
                    .execute(&self.pool)
                    .await
                    .map_err(StoreError::from)?;
                summary.remaining += 1;
            }
        }

        tracing::info!(
            "[Mirror] Replay pass done: {} replayed, {} discarded, {} remaining",
            summary.replayed,
            summary.discarded,
            summary.remaining
        );
        broadcast_event(
            &self.events,
            SyncEvent::MirrorReplayComplete {
                replayed: summary.replayed,
                remaining: summary.remaining,
            },
        );

        Ok(summary)
    }

    /// Replay on every offline→online transition
    pub fn spawn(self, network: NetworkMonitor) -> JoinHandle<()> {
        let mut network_rx = network.subscribe();

        tokio::spawn(async move {
            tracing::info!("[Mirror] Background loop started");

            while network_rx.changed().await.is_ok() {
                if !network_rx.borrow_and_update().is_online() {
                    continue;
                }
                if let Err(e) = self.replay().await {
                    tracing::error!("[Mirror] Replay failed: {}", e);
                }
            }

            tracing::info!("[Mirror] Background loop stopped");
        })
    }
}

/// Same derivation as outbox keys, over the raw body
fn mirror_idempotency_key(request: &MirrorRequest, at: &DateTime<Utc>) -> String {
    let body = request
        .body
        .as_deref()
        .map(|raw| serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
        .unwrap_or(Value::Null);
    QueuedAction::idempotency_key_for(request.method, &request.path(), &body, at).to_string()
}
