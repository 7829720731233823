//! # API Proxy
//!
//! Single entry point for domain reads and writes.
//!
//! - `get`: online fetch, cached on success. On failure the fresh cache entry
//!   answers, then the local entities, otherwise the call fails with
//!   [`SyncError::UnavailableOffline`].
//! - `post`/`put`/`patch`/`delete`: online direct attempt. On a network error,
//!   a timeout, 408, 429 or 5xx (or when offline) the write is queued in the
//!   outbox, applied optimistically and answered with a provisional body.
//!   Other 4xx replies are returned as [`SyncError::Rejected`].
//!
//! Without a local store (store failed to open) the proxy is online-only:
//! nothing is cached and nothing is queued.

use chrono::Utc;
use serde_json::{json, Value};

use crate::client::local_store::LocalStore;
use crate::client::offline::optimistic::payload_id;
use crate::client::offline::{NewAction, OptimisticManager, Outbox};
use crate::client::sync::{ConflictLedger, NetworkMonitor};
use crate::client::transport::{HttpBackend, HttpResponse};
use crate::shared::error::SyncError;
use crate::shared::model::{ActionKind, CachedResponse, HttpMethod, LocalEntity, QueuedAction, ResourcePath};

type Result<T> = std::result::Result<T, SyncError>;

/// Where a response body came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    LocalData,
    /// Optimistic result of a queued write
    Provisional,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub body: Value,
    pub source: ResponseSource,
    /// Outbox action backing a provisional response
    pub action_id: Option<i64>,
}

impl ApiResponse {
    fn new(body: Value, source: ResponseSource) -> Self {
        Self {
            body,
            source,
            action_id: None,
        }
    }

    /// Callers must treat provisional bodies as not yet accepted
    pub fn is_provisional(&self) -> bool {
        self.source == ResponseSource::Provisional
    }
}

/// Offline half of the proxy, absent when the store is unavailable
#[derive(Debug, Clone)]
struct OfflineLayer {
    store: LocalStore,
    outbox: Outbox,
    optimistic: OptimisticManager,
    ledger: ConflictLedger,
}

/// Network-boundary proxy
#[derive(Debug, Clone)]
pub struct ApiProxy {
    backend: HttpBackend,
    network: NetworkMonitor,
    offline: Option<OfflineLayer>,
}

impl ApiProxy {
    /// Proxy with offline fallback
    pub fn new(backend: HttpBackend, network: NetworkMonitor, outbox: Outbox, ledger: ConflictLedger) -> Self {
        let store = outbox.store().clone();
        Self {
            backend,
            network,
            offline: Some(OfflineLayer {
                optimistic: OptimisticManager::new(store.clone()),
                store,
                outbox,
                ledger,
            }),
        }
    }

    /// Proxy without a local store
    pub fn online_only(backend: HttpBackend, network: NetworkMonitor) -> Self {
        Self {
            backend,
            network,
            offline: None,
        }
    }

    pub fn has_offline_support(&self) -> bool {
        self.offline.is_some()
    }

    pub async fn get(&self, endpoint: &str) -> Result<ApiResponse> {
        if self.network.is_online() {
            match self.backend.send(HttpMethod::Get, endpoint, None, None).await {
                Ok(response) if response.is_success() => {
                    if let Some(offline) = &self.offline {
                        if let Err(e) = offline.absorb(endpoint, &response.body).await {
                            tracing::warn!("[Proxy] Could not store response for {}: {}", endpoint, e);
                        }
                    }
                    return Ok(ApiResponse::new(response.body, ResponseSource::Network));
                }
                Ok(response) if !response.is_transient_failure() => {
                    return Err(rejected(&response));
                }
                Ok(response) => {
                    tracing::warn!("[Proxy] GET {} failed: {}", endpoint, response.error_summary());
                }
                Err(e) => {
                    tracing::warn!("[Proxy] GET {} failed: {}", endpoint, e);
                }
            }
        }

        let Some(offline) = &self.offline else {
            return Err(SyncError::unavailable_offline(endpoint));
        };

        let cached: Option<CachedResponse> = offline.store.get(endpoint).await?;
        if let Some(cached) = cached {
            if cached.is_fresh_at(Utc::now(), self.backend.config().cache_ttl()) {
                tracing::debug!("[Proxy] GET {} answered from cache", endpoint);
                return Ok(ApiResponse::new(cached.payload, ResponseSource::Cache));
            }
        }

        if let Some(body) = offline.local_lookup(endpoint).await? {
            tracing::debug!("[Proxy] GET {} answered from local data", endpoint);
            return Ok(ApiResponse::new(body, ResponseSource::LocalData));
        }

        Err(SyncError::unavailable_offline(endpoint))
    }

    pub async fn post(&self, target: &str, payload: Value) -> Result<ApiResponse> {
        self.write(HttpMethod::Post, target, payload).await
    }

    pub async fn put(&self, target: &str, payload: Value) -> Result<ApiResponse> {
        self.write(HttpMethod::Put, target, payload).await
    }

    pub async fn patch(&self, target: &str, payload: Value) -> Result<ApiResponse> {
        self.write(HttpMethod::Patch, target, payload).await
    }

    pub async fn delete(&self, target: &str) -> Result<ApiResponse> {
        self.write(HttpMethod::Delete, target, Value::Null).await
    }

    /// Issue a write, queueing it when the server cannot be reached
    pub async fn write(&self, method: HttpMethod, target: &str, payload: Value) -> Result<ApiResponse> {
        let kind = ActionKind::for_method(method)
            .ok_or_else(|| SyncError::validation("method", "GET is not a write"))?;
        let path = ResourcePath::parse(target)
            .ok_or_else(|| SyncError::validation("target", "target path cannot be empty"))?;

        // One key for the direct attempt and every replay of this write
        let idempotency_key = QueuedAction::idempotency_key_for(method, target, &payload, &Utc::now());

        if self.network.is_online() {
            let body = (!payload.is_null()).then_some(&payload);
            match self.backend.send(method, target, body, Some(idempotency_key)).await {
                Ok(response) if response.is_success() => {
                    if let Some(offline) = &self.offline {
                        let local_id = path.entity_id.clone().or_else(|| payload_id(&payload));
                        if let Err(e) = offline
                            .optimistic
                            .confirm(&path.entity_type, local_id.as_deref(), method, &response.body)
                            .await
                        {
                            tracing::warn!("[Proxy] Could not store confirmed {}: {}", target, e);
                        }
                    }
                    return Ok(ApiResponse::new(response.body, ResponseSource::Network));
                }
                Ok(response) if !response.is_transient_failure() => {
                    return Err(rejected(&response));
                }
                Ok(response) => {
                    tracing::warn!("[Proxy] {} {} failed: {}", method, target, response.error_summary());
                }
                Err(e) => {
                    tracing::warn!("[Proxy] {} {} failed: {}", method, target, e);
                }
            }
        }

        let Some(offline) = &self.offline else {
            return Err(SyncError::unavailable_offline(target));
        };

        let entity = offline.optimistic.apply(method, &path, &payload).await?;
        let local_id = entity
            .as_ref()
            .map(|e| e.id.clone())
            .or_else(|| path.entity_id.clone());

        let mut new_action = NewAction::new(kind, target, method, payload);
        new_action.idempotency_key = Some(idempotency_key);
        if let Some(id) = &local_id {
            new_action = new_action.with_local_entity(id);
        }
        let action = offline.outbox.enqueue_action(new_action).await?;

        let body = match entity {
            Some(entity) => entity.to_response_body(),
            None => json!({ "id": local_id, "is_local_only": true }),
        };

        Ok(ApiResponse {
            body,
            source: ResponseSource::Provisional,
            action_id: Some(action.id),
        })
    }
}

impl OfflineLayer {
    /// Cache a successful read and mirror its entities into `local_data`
    async fn absorb(&self, endpoint: &str, body: &Value) -> Result<()> {
        self.store.put(&CachedResponse::new(endpoint, body.clone())).await?;

        let Some(path) = ResourcePath::parse(endpoint) else {
            return Ok(());
        };

        let items: Vec<&Value> = match body {
            Value::Array(items) => items.iter().collect(),
            Value::Object(_) => vec![body],
            _ => Vec::new(),
        };

        for item in items {
            let id = match (&path.entity_id, payload_id(item)) {
                (_, Some(id)) => id,
                (Some(id), None) => id.clone(),
                (None, None) => continue,
            };
            self.observe_server_value(&path.entity_type, &id, item).await?;
        }

        Ok(())
    }

    /// Compare a fresh server value with the local slot
    ///
    /// A provisional entity with pending writes that differs from the server
    /// is a conflict; anything else is overwritten by the server value.
    async fn observe_server_value(&self, entity_type: &str, id: &str, server: &Value) -> Result<()> {
        let key = LocalEntity::key_for(entity_type, id);
        let local: Option<LocalEntity> = self.store.get(&key).await?;

        if let Some(local) = local.filter(|e| e.is_local_only) {
            if self.outbox.pending_for_entity(&key).await?.is_empty() {
                self.store
                    .put(&LocalEntity::confirmed(entity_type, id, server.clone()))
                    .await?;
            } else if &local.payload != server {
                self.ledger
                    .handle_divergence(entity_type, id, local.payload, server.clone())
                    .await?;
            }
            return Ok(());
        }

        self.store
            .put(&LocalEntity::confirmed(entity_type, id, server.clone()))
            .await?;
        Ok(())
    }

    /// Answer a read from local entities
    async fn local_lookup(&self, endpoint: &str) -> Result<Option<Value>> {
        let Some(path) = ResourcePath::parse(endpoint) else {
            return Ok(None);
        };

        match path.entity_key() {
            Some(key) => {
                let entity: Option<LocalEntity> = self.store.get(&key).await?;
                Ok(entity.map(|e| e.to_response_body()))
            }
            None => {
                let entities: Vec<LocalEntity> = self
                    .store
                    .get_by_index("entity_type", &Value::String(path.entity_type.clone()))
                    .await?;
                if entities.is_empty() {
                    return Ok(None);
                }
                Ok(Some(Value::Array(
                    entities.iter().map(LocalEntity::to_response_body).collect(),
                )))
            }
        }
    }
}

fn rejected(response: &HttpResponse) -> SyncError {
    SyncError::Rejected {
        status: response.status,
        message: response.error_summary(),
    }
}
