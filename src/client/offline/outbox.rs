//! # Mutation Outbox
//!
//! Durable staging of deferred writes in the `outbox` partition.
//!
//! - Action ids come from a monotonic store sequence, so sorting by id gives
//!   enqueue order. Replay is FIFO per `entity_key`.
//! - Apart from `retry_count`, an action is never modified after creation.
//! - An action leaves the outbox on delivery, on cancellation, or by being
//!   moved to the `dead_letters` partition (retry exhaustion, superseded by a
//!   conflict resolution). Every move emits exactly one `ActionDropped`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use reliefsync::client::offline::Outbox;
//! use reliefsync::shared::model::{ActionKind, HttpMethod};
//!
//! # async fn example(outbox: Outbox) -> Result<(), reliefsync::shared::error::SyncError> {
//! let id = outbox
//!     .enqueue(ActionKind::Create, "/needs", HttpMethod::Post, serde_json::json!({"title": "Water"}))
//!     .await?;
//! for action in outbox.list_pending().await? {
//!     // deliver...
//!     outbox.remove(action.id).await?;
//! }
//! # let _ = id;
//! # Ok(())
//! # }
//! ```

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::client::local_store::{LocalStore, Partition};
use crate::client::offline::optimistic::OptimisticManager;
use crate::shared::error::SyncError;
use crate::shared::event::{broadcast_event, SyncEvent, SyncEventBroadcast};
use crate::shared::model::{
    ActionKind, DeadLetter, DropReason, HttpMethod, LocalEntity, QueuedAction, ResourcePath,
};

type Result<T> = std::result::Result<T, SyncError>;

/// Host hook asking for a background replay opportunity
///
/// Best-effort: a requester that cannot schedule anything returns `false`
/// and enqueue proceeds regardless.
pub trait ReplayRequester: Send + Sync {
    fn request_replay(&self) -> bool;
}

impl ReplayRequester for Notify {
    fn request_replay(&self) -> bool {
        self.notify_one();
        true
    }
}

/// A write to stage in the outbox
#[derive(Debug, Clone)]
pub struct NewAction {
    pub kind: ActionKind,
    pub target: String,
    pub method: HttpMethod,
    pub payload: Value,
    /// Optimistic entity written for this action
    pub local_entity_id: Option<String>,
    /// Overrides the derived idempotency key (requeue of a dead letter)
    pub idempotency_key: Option<Uuid>,
}

impl NewAction {
    pub fn new(kind: ActionKind, target: impl Into<String>, method: HttpMethod, payload: Value) -> Self {
        Self {
            kind,
            target: target.into(),
            method,
            payload,
            local_entity_id: None,
            idempotency_key: None,
        }
    }

    pub fn with_local_entity(mut self, id: impl Into<String>) -> Self {
        self.local_entity_id = Some(id.into());
        self
    }
}

/// Durable outbox of deferred writes
#[derive(Clone)]
pub struct Outbox {
    store: LocalStore,
    events: SyncEventBroadcast,
    default_max_retries: u32,
    replay: Option<Arc<dyn ReplayRequester>>,
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("default_max_retries", &self.default_max_retries)
            .field("replay", &self.replay.is_some())
            .finish()
    }
}

impl Outbox {
    pub fn new(store: LocalStore, events: SyncEventBroadcast, default_max_retries: u32) -> Self {
        Self {
            store,
            events,
            default_max_retries,
            replay: None,
        }
    }

    /// Attach the host's background replay hook
    pub fn with_replay_requester(mut self, requester: Arc<dyn ReplayRequester>) -> Self {
        self.replay = Some(requester);
        self
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Queue a write; returns the new action id
    pub async fn enqueue(
        &self,
        kind: ActionKind,
        target: &str,
        method: HttpMethod,
        payload: Value,
    ) -> Result<i64> {
        let action = self.enqueue_action(NewAction::new(kind, target, method, payload)).await?;
        Ok(action.id)
    }

    /// Queue a write and return the stored action
    pub async fn enqueue_action(&self, new: NewAction) -> Result<QueuedAction> {
        if !new.method.is_write() {
            return Err(SyncError::validation("method", "only writes can be queued"));
        }
        let path = ResourcePath::parse(&new.target)
            .ok_or_else(|| SyncError::validation("target", "target path cannot be empty"))?;

        let entity_key = match (&path.entity_id, &new.local_entity_id) {
            (Some(_), _) => path.entity_key().unwrap_or_else(|| path.entity_type.clone()),
            (None, Some(local_id)) => LocalEntity::key_for(&path.entity_type, local_id),
            (None, None) => path.entity_type.clone(),
        };

        let id = self.store.next_sequence(Partition::Outbox).await?;
        let enqueued_at = Utc::now();
        let idempotency_key = new.idempotency_key.unwrap_or_else(|| {
            QueuedAction::idempotency_key_for(new.method, &new.target, &new.payload, &enqueued_at)
        });

        let action = QueuedAction {
            id,
            kind: new.kind,
            target: new.target,
            method: new.method,
            payload: new.payload,
            enqueued_at,
            retry_count: 0,
            max_retries: self.default_max_retries,
            entity_type: path.entity_type,
            entity_key,
            local_entity_id: new.local_entity_id,
            idempotency_key,
        };
        self.store.put(&action).await?;

        tracing::info!("[Outbox] Queued action {} {} {}", action.id, action.method, action.target);

        if let Some(replay) = &self.replay {
            if !replay.request_replay() {
                tracing::debug!("[Outbox] Background replay not available");
            }
        }

        Ok(action)
    }

    /// Pending actions in enqueue order
    pub async fn list_pending(&self) -> Result<Vec<QueuedAction>> {
        let mut actions: Vec<QueuedAction> = self.store.get_all().await?;
        actions.sort_by_key(|a| a.id);
        Ok(actions)
    }

    /// Pending actions addressing one entity, in enqueue order
    pub async fn pending_for_entity(&self, entity_key: &str) -> Result<Vec<QueuedAction>> {
        let mut actions: Vec<QueuedAction> = self
            .store
            .get_by_index("entity_key", &Value::String(entity_key.to_string()))
            .await?;
        actions.sort_by_key(|a| a.id);
        Ok(actions)
    }

    pub async fn get(&self, action_id: i64) -> Result<Option<QueuedAction>> {
        Ok(self.store.get(&action_id.to_string()).await?)
    }

    pub async fn count_pending(&self) -> Result<u64> {
        Ok(self.store.count::<QueuedAction>().await?)
    }

    /// Remove an action; absent ids are not an error
    pub async fn remove(&self, action_id: i64) -> Result<bool> {
        Ok(self.store.delete::<QueuedAction>(&action_id.to_string()).await?)
    }

    /// Count one failed delivery attempt
    ///
    /// Re-reads the action first so a concurrent removal is not undone.
    /// Returns the updated action, or `None` if it is gone.
    pub async fn record_failure(&self, action_id: i64) -> Result<Option<QueuedAction>> {
        let Some(mut action) = self.get(action_id).await? else {
            return Ok(None);
        };
        action.retry_count += 1;
        self.store.put(&action).await?;

        tracing::warn!(
            "[Outbox] Action {} failed ({}/{})",
            action.id,
            action.retry_count,
            action.max_retries
        );
        Ok(Some(action))
    }

    /// Move an action to the dead-letter partition and announce the drop
    pub async fn drop_to_dead_letter(
        &self,
        action: QueuedAction,
        reason: DropReason,
        last_error: Option<String>,
    ) -> Result<DeadLetter> {
        let dead_letter = DeadLetter {
            id: action.id.to_string(),
            action,
            reason,
            last_error,
            dropped_at: Utc::now(),
        };
        self.store.put(&dead_letter).await?;
        self.remove(dead_letter.action.id).await?;

        tracing::error!(
            "[Outbox] Dropped action {} {} {} ({:?}): {}",
            dead_letter.action.id,
            dead_letter.action.method,
            dead_letter.action.target,
            reason,
            dead_letter.last_error.as_deref().unwrap_or("no error recorded")
        );

        broadcast_event(
            &self.events,
            SyncEvent::ActionDropped {
                action_id: dead_letter.action.id,
                target: dead_letter.action.target.clone(),
                reason,
                last_error: dead_letter.last_error.clone(),
            },
        );

        Ok(dead_letter)
    }

    pub async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let mut letters: Vec<DeadLetter> = self.store.get_all().await?;
        letters.sort_by_key(|l| l.dropped_at);
        Ok(letters)
    }

    /// Put a dropped write back in the outbox with a fresh retry budget
    ///
    /// The idempotency key is kept, it is still the same logical write.
    pub async fn requeue_dead_letter(&self, id: &str) -> Result<QueuedAction> {
        let letter: DeadLetter = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| SyncError::not_found("dead letter", id))?;

        let action = letter.action;
        let requeued = self
            .enqueue_action(NewAction {
                kind: action.kind,
                target: action.target,
                method: action.method,
                payload: action.payload,
                local_entity_id: action.local_entity_id,
                idempotency_key: Some(action.idempotency_key),
            })
            .await?;
        self.store.delete::<DeadLetter>(id).await?;

        tracing::info!("[Outbox] Requeued dead letter {} as action {}", id, requeued.id);
        Ok(requeued)
    }

    pub async fn discard_dead_letter(&self, id: &str) -> Result<bool> {
        Ok(self.store.delete::<DeadLetter>(id).await?)
    }

    /// User cancellation of a pending write
    ///
    /// Removes the action and reverts its optimistic entity unless another
    /// pending action still references that entity.
    pub async fn cancel(&self, action_id: i64) -> Result<QueuedAction> {
        let action = self
            .get(action_id)
            .await?
            .ok_or_else(|| SyncError::not_found("action", action_id.to_string()))?;
        self.remove(action_id).await?;

        if let Some(local_id) = &action.local_entity_id {
            let still_referenced = self
                .pending_for_entity(&action.entity_key)
                .await?
                .iter()
                .any(|other| other.local_entity_id.as_deref() == Some(local_id.as_str()));

            if !still_referenced {
                OptimisticManager::new(self.store.clone())
                    .revert(&action.entity_type, local_id)
                    .await?;
            }
        }

        tracing::info!("[Outbox] Cancelled action {} {}", action.id, action.target);
        Ok(action)
    }
}
