//! # Network Monitor
//!
//! Holds the host's connectivity signal. The current status is published on a
//! `watch` channel so background loops can react to offline→online
//! transitions, and every change is announced as `ConnectivityChanged`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use crate::client::transport::HttpBackend;
use crate::shared::event::{broadcast_event, SyncEvent, SyncEventBroadcast};
use crate::shared::model::HttpMethod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Online,
    Offline,
}

impl NetworkStatus {
    pub fn from_online(online: bool) -> Self {
        if online {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, NetworkStatus::Online)
    }
}

/// Shared connectivity state; cheap to clone
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    status: Arc<watch::Sender<NetworkStatus>>,
    events: SyncEventBroadcast,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus, events: SyncEventBroadcast) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            status: Arc::new(tx),
            events,
        }
    }

    pub fn get_status(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.get_status().is_online()
    }

    /// Apply a host connectivity signal; returns whether the status changed
    pub fn set_online(&self, online: bool) -> bool {
        let next = NetworkStatus::from_online(online);
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });

        if changed {
            tracing::info!("[Network] Connectivity changed: {:?}", next);
            broadcast_event(&self.events, SyncEvent::ConnectivityChanged { online });
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }

    /// Derive connectivity from a request to the backend
    ///
    /// Any HTTP response counts as online; only transport failures count as
    /// offline.
    pub async fn probe(&self, backend: &HttpBackend, path: &str) -> NetworkStatus {
        let online = backend.send(HttpMethod::Get, path, None, None).await.is_ok();
        self.set_online(online);
        NetworkStatus::from_online(online)
    }
}
