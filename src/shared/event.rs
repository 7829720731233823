//! Sync Lifecycle Events
//!
//! Components never call each other across execution contexts; they publish
//! `SyncEvent`s on a `tokio::sync::broadcast` channel instead. The UI listens
//! to the same channel to surface dropped writes, pending conflicts and sync
//! progress.
//!
//! Events are broadcast with [`broadcast_event`]; having no subscribers is
//! not an error.

use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::shared::model::{DropReason, ResolutionKind};

/// Capacity of the event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event published by the sync subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A sync cycle delivered every action it attempted
    SyncComplete {
        delivered: usize,
        remaining: usize,
    },
    /// A sync cycle ended with at least one failed delivery
    SyncFailed {
        delivered: usize,
        failed: usize,
        remaining: usize,
        error: Option<String>,
    },
    /// A queued write left the outbox without being delivered
    ActionDropped {
        action_id: i64,
        target: String,
        reason: DropReason,
        last_error: Option<String>,
    },
    /// The durable store failed to open; running online-only
    StoreUnavailable {
        reason: String,
    },
    ConnectivityChanged {
        online: bool,
    },
    ConflictDetected {
        conflict_id: String,
        entity_type: String,
        entity_id: String,
        resolution: ResolutionKind,
    },
    /// A pending (`manual`) conflict received its terminal resolution
    ConflictResolved {
        conflict_id: String,
        resolution: ResolutionKind,
    },
    /// The mirror queue persisted a failed write
    MirrorQueued {
        request_id: i64,
        url: String,
    },
    /// The mirror queue finished a replay pass
    MirrorReplayComplete {
        replayed: usize,
        remaining: usize,
    },
}

/// Broadcast channel for sync events
pub type SyncEventBroadcast = broadcast::Sender<SyncEvent>;

/// Create a new event channel
pub fn event_channel() -> SyncEventBroadcast {
    let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tx
}

/// Broadcast an event to all subscribers
///
/// Returns the number of subscribers that received the event (0 if none).
pub fn broadcast_event(broadcast_tx: &SyncEventBroadcast, event: SyncEvent) -> usize {
    match broadcast_tx.send(event) {
        Ok(subscriber_count) => subscriber_count,
        Err(e) => {
            // No subscribers, that's okay
            tracing::debug!("[Events] No subscribers to receive event: {:?}", e.0);
            0
        }
    }
}

/// Subscribe to the channel as a `Stream`
///
/// Lagged receivers skip the missed events; the stream ends when every
/// sender is dropped.
pub fn event_stream(broadcast_tx: &SyncEventBroadcast) -> impl Stream<Item = SyncEvent> + Send + 'static {
    stream::unfold(broadcast_tx.subscribe(), |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("[Events] Subscriber lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}
