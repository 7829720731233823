//! # Optimistic Local Writes
//!
//! Writes that cannot reach the server are applied to `local_data` right away
//! so reads see them immediately. Such entities carry `is_local_only = true`
//! until a replay is confirmed by the server.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use reliefsync::client::local_store::LocalStore;
//! use reliefsync::client::offline::OptimisticManager;
//! use reliefsync::shared::model::{HttpMethod, ResourcePath};
//!
//! # async fn example(store: LocalStore) -> Result<(), reliefsync::shared::error::StoreError> {
//! let manager = OptimisticManager::new(store);
//! let path = ResourcePath::parse("/needs").unwrap();
//! let entity = manager
//!     .apply(HttpMethod::Post, &path, &serde_json::json!({"title": "Water"}))
//!     .await?;
//! assert!(entity.unwrap().is_local_only);
//! # Ok(())
//! # }
//! ```

use serde_json::Value;
use uuid::Uuid;

use crate::client::local_store::{LocalStore, Result};
use crate::shared::model::{HttpMethod, LocalEntity, ResourcePath};

/// Id carried by a payload's `id` field, if it is a string or a number
pub fn payload_id(payload: &Value) -> Option<String> {
    match payload.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Id a write addresses: path id, then payload id, then a fresh local id
pub fn entity_id_for(path: &ResourcePath, payload: &Value) -> String {
    path.entity_id
        .clone()
        .or_else(|| payload_id(payload))
        .unwrap_or_else(|| format!("local-{}", Uuid::new_v4()))
}

/// Applies and settles optimistic writes in `local_data`
#[derive(Debug, Clone)]
pub struct OptimisticManager {
    store: LocalStore,
}

impl OptimisticManager {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Apply an optimistic write
    ///
    /// `POST` and `PUT` store the payload as-is, `PATCH` overlays the payload
    /// on the current entity, `DELETE` removes the entity and returns `None`.
    pub async fn apply(
        &self,
        method: HttpMethod,
        path: &ResourcePath,
        payload: &Value,
    ) -> Result<Option<LocalEntity>> {
        let id = entity_id_for(path, payload);
        let key = LocalEntity::key_for(&path.entity_type, &id);

        let body = match method {
            HttpMethod::Get => return Ok(None),
            HttpMethod::Delete => {
                self.store.delete::<LocalEntity>(&key).await?;
                tracing::debug!("[Optimistic] Removed {}", key);
                return Ok(None);
            }
            HttpMethod::Patch => {
                let current: Option<LocalEntity> = self.store.get(&key).await?;
                match current {
                    Some(current) => overlay(current.payload, payload),
                    None => payload.clone(),
                }
            }
            HttpMethod::Post | HttpMethod::Put => payload.clone(),
        };

        let entity = LocalEntity::provisional(&path.entity_type, id, body);
        self.store.put(&entity).await?;
        tracing::debug!("[Optimistic] Applied {} {}", method, entity.key());

        Ok(Some(entity))
    }

    /// Replace a provisional entity with the server-confirmed record
    ///
    /// The confirmed id is taken from the response body when it has one,
    /// otherwise the local id is kept.
    pub async fn confirm(
        &self,
        entity_type: &str,
        local_id: Option<&str>,
        method: HttpMethod,
        response: &Value,
    ) -> Result<Option<LocalEntity>> {
        if method == HttpMethod::Delete {
            if let Some(id) = local_id {
                self.store.delete::<LocalEntity>(&LocalEntity::key_for(entity_type, id)).await?;
            }
            return Ok(None);
        }

        let confirmed_id = payload_id(response).or_else(|| local_id.map(str::to_string));
        let Some(confirmed_id) = confirmed_id else {
            return Ok(None);
        };

        if let Some(local_id) = local_id {
            if local_id != confirmed_id {
                self.store
                    .delete::<LocalEntity>(&LocalEntity::key_for(entity_type, local_id))
                    .await?;
            }
        }

        let payload = if response.is_object() {
            response.clone()
        } else {
            match local_id {
                Some(id) => self
                    .store
                    .get::<LocalEntity>(&LocalEntity::key_for(entity_type, id))
                    .await?
                    .map(|e| e.payload)
                    .unwrap_or(Value::Null),
                None => Value::Null,
            }
        };

        let entity = LocalEntity::confirmed(entity_type, confirmed_id, payload);
        self.store.put(&entity).await?;
        tracing::debug!("[Optimistic] Confirmed {}", entity.key());

        Ok(Some(entity))
    }

    /// Drop a provisional entity
    ///
    /// Confirmed entities are left alone. Returns whether anything was removed.
    pub async fn revert(&self, entity_type: &str, id: &str) -> Result<bool> {
        let key = LocalEntity::key_for(entity_type, id);
        match self.store.get::<LocalEntity>(&key).await? {
            Some(entity) if entity.is_local_only => {
                self.store.delete::<LocalEntity>(&key).await?;
                tracing::info!("[Optimistic] Reverted {}", key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Shallow object overlay: keys of `patch` replace keys of `base`
fn overlay(base: Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(mut base), Value::Object(patch)) => {
            for (k, v) in patch {
                base.insert(k.clone(), v.clone());
            }
            Value::Object(base)
        }
        (_, patch) => patch.clone(),
    }
}
