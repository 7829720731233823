//! # Conflict Ledger
//!
//! Records every detected divergence in the `conflicts` partition and applies
//! its outcome to local state:
//!
//! - `server`: the server value takes the entity slot; pending writes for the
//!   entity are moved to dead letters as superseded
//! - `merge`: the merged value is written with a merge marker and the pending
//!   writes are replaced by a single `PUT` of the merged payload
//! - `local`: local entity and pending writes are kept
//! - `manual`: nothing is touched until [`ConflictLedger::resolve_conflict`]
//!
//! A `manual` record transitions to a terminal resolution exactly once.
//!
//! An entity has at most one open record. A divergence observed while a
//! `manual` record is pending, or while the same local value already stands
//! under a `local` ruling, refreshes that record instead of opening another.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::client::local_store::LocalStore;
use crate::client::offline::{NewAction, Outbox};
use crate::client::sync::conflict_resolver::{ConflictResolver, ResolutionStrategy};
use crate::client::sync::metrics::ConflictMetrics;
use crate::shared::error::SyncError;
use crate::shared::event::{broadcast_event, SyncEvent, SyncEventBroadcast};
use crate::shared::model::{
    ActionKind, ConflictRecord, DropReason, HttpMethod, LocalEntity, ResolutionKind,
};

type Result<T> = std::result::Result<T, SyncError>;

/// Conflict bookkeeping; cheap to clone
#[derive(Debug, Clone)]
pub struct ConflictLedger {
    store: LocalStore,
    outbox: Outbox,
    resolver: Arc<RwLock<ConflictResolver>>,
    metrics: Arc<RwLock<ConflictMetrics>>,
    events: SyncEventBroadcast,
}

impl ConflictLedger {
    pub fn new(outbox: Outbox, resolver: ConflictResolver, events: SyncEventBroadcast) -> Self {
        Self {
            store: outbox.store().clone(),
            outbox,
            resolver: Arc::new(RwLock::new(resolver)),
            metrics: Arc::new(RwLock::new(ConflictMetrics::default())),
            events,
        }
    }

    /// Register or replace the strategy for an entity type
    pub async fn register_strategy(&self, entity_type: impl Into<String>, strategy: ResolutionStrategy) {
        self.resolver.write().await.register(entity_type, strategy);
    }

    /// Resolve a divergence, persist the record and apply the outcome
    pub async fn handle_divergence(
        &self,
        entity_type: &str,
        entity_id: &str,
        local_payload: Value,
        server_payload: Value,
    ) -> Result<ConflictRecord> {
        if let Some(mut open) = self.open_record(entity_type, entity_id, &local_payload).await? {
            open.local_payload = local_payload;
            open.server_payload = server_payload;
            self.store.put(&open).await?;
            tracing::debug!(
                "[Conflict] {}:{} already recorded as {} ({}), server value refreshed",
                entity_type,
                entity_id,
                open.id,
                open.resolution
            );
            return Ok(open);
        }

        let started = std::time::Instant::now();

        let (resolution, strategy) = {
            let resolver = self.resolver.read().await;
            let resolution = resolver.resolve(entity_id, entity_type, &local_payload, &server_payload);
            (resolution, resolver.strategy_for(entity_type).name().to_string())
        };

        let now = Utc::now();
        let kind = resolution.kind();
        let record = ConflictRecord {
            id: Uuid::new_v4().to_string(),
            entity_id: entity_id.to_string(),
            entity_type: entity_type.to_string(),
            local_payload,
            server_payload,
            resolution: kind,
            strategy,
            detected_at: now,
            resolved_at: kind.is_terminal().then_some(now),
            merged_payload: resolution.merged_payload().cloned(),
        };
        self.store.put(&record).await?;

        self.apply_outcome(&record).await?;

        {
            let mut metrics = self.metrics.write().await;
            metrics.record_detected();
            if kind.is_terminal() {
                metrics.record_auto_resolved(started.elapsed());
            }
        }

        tracing::info!(
            "[Conflict] {}:{} detected, resolution {} ({})",
            entity_type,
            entity_id,
            kind,
            record.strategy
        );
        broadcast_event(
            &self.events,
            SyncEvent::ConflictDetected {
                conflict_id: record.id.clone(),
                entity_type: record.entity_type.clone(),
                entity_id: record.entity_id.clone(),
                resolution: kind,
            },
        );

        Ok(record)
    }

    /// Settle a pending (`manual`) conflict
    ///
    /// `merged_payload` is required for a `merge` resolution.
    pub async fn resolve_conflict(
        &self,
        id: &str,
        resolution: ResolutionKind,
        merged_payload: Option<Value>,
    ) -> Result<ConflictRecord> {
        let mut record: ConflictRecord = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| SyncError::ConflictNotFound { id: id.to_string() })?;

        if !record.is_pending() {
            return Err(SyncError::ConflictAlreadyResolved { id: id.to_string() });
        }
        if !resolution.is_terminal() {
            return Err(SyncError::validation("resolution", "manual is not a terminal resolution"));
        }
        if resolution == ResolutionKind::Merge && merged_payload.is_none() {
            return Err(SyncError::validation("merged_payload", "required for a merge resolution"));
        }

        let now = Utc::now();
        record.resolution = resolution;
        record.resolved_at = Some(now);
        record.merged_payload = match resolution {
            ResolutionKind::Merge => merged_payload,
            _ => None,
        };
        self.store.put(&record).await?;

        self.apply_outcome(&record).await?;

        let latency = (now - record.detected_at).to_std().unwrap_or_default();
        self.metrics.write().await.record_manually_resolved(latency);

        tracing::info!("[Conflict] {} resolved manually as {}", record.id, resolution);
        broadcast_event(
            &self.events,
            SyncEvent::ConflictResolved {
                conflict_id: record.id.clone(),
                resolution,
            },
        );

        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ConflictRecord>> {
        Ok(self.store.get(id).await?)
    }

    /// Conflicts waiting for a human decision, oldest first
    pub async fn pending_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let mut pending: Vec<ConflictRecord> = self
            .store
            .get_by_index("resolution", &Value::String(ResolutionKind::Manual.as_str().to_string()))
            .await?;
        pending.sort_by_key(|c| c.detected_at);
        Ok(pending)
    }

    /// Entity keys (`type:id`) with a conflict waiting for a human decision
    pub async fn pending_entity_keys(&self) -> Result<HashSet<String>> {
        Ok(self
            .pending_conflicts()
            .await?
            .iter()
            .map(|c| LocalEntity::key_for(&c.entity_type, &c.entity_id))
            .collect())
    }

    pub async fn list_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        Ok(self.store.get_all().await?)
    }

    /// Read-only snapshot of the counters
    pub async fn metrics(&self) -> ConflictMetrics {
        self.metrics.read().await.clone()
    }

    /// Record a new divergence should fold into, if any
    async fn open_record(
        &self,
        entity_type: &str,
        entity_id: &str,
        local_payload: &Value,
    ) -> Result<Option<ConflictRecord>> {
        let records: Vec<ConflictRecord> = self
            .store
            .get_by_index("entity_id", &Value::String(entity_id.to_string()))
            .await?;

        Ok(records.into_iter().rev().find(|r| {
            r.entity_type == entity_type
                && (r.is_pending()
                    || (r.resolution == ResolutionKind::Local && &r.local_payload == local_payload))
        }))
    }

    async fn apply_outcome(&self, record: &ConflictRecord) -> Result<()> {
        let key = LocalEntity::key_for(&record.entity_type, &record.entity_id);

        match record.resolution {
            ResolutionKind::Server => {
                let entity = LocalEntity::confirmed(
                    &record.entity_type,
                    &record.entity_id,
                    record.server_payload.clone(),
                );
                self.store.put(&entity).await?;

                for action in self.outbox.pending_for_entity(&key).await? {
                    self.outbox
                        .drop_to_dead_letter(
                            action,
                            DropReason::Superseded,
                            Some(format!("conflict {} resolved in favour of server", record.id)),
                        )
                        .await?;
                }
            }
            ResolutionKind::Merge => {
                let merged = record.merged_payload.clone().unwrap_or(Value::Null);

                for action in self.outbox.pending_for_entity(&key).await? {
                    self.outbox.remove(action.id).await?;
                }

                let mut entity = LocalEntity::provisional(&record.entity_type, &record.entity_id, merged.clone());
                entity.merged_at = Some(Utc::now());
                entity.merge_strategy = Some(record.strategy.clone());
                self.store.put(&entity).await?;

                let target = format!("/{}/{}", record.entity_type, record.entity_id);
                self.outbox
                    .enqueue_action(
                        NewAction::new(ActionKind::Update, target, HttpMethod::Put, merged)
                            .with_local_entity(&record.entity_id),
                    )
                    .await?;
            }
            ResolutionKind::Local | ResolutionKind::Manual => {}
        }

        Ok(())
    }
}
