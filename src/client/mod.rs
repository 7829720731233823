//! # Offline Client
//!
//! Wires the offline-first subsystem together:
//!
//! - `local_store/`: durable partitioned store (SQLite)
//! - `offline/`: outbox, optimistic writes, retry backoff
//! - `sync/`: orchestrator, planner, conflict engine, network and bandwidth
//! - `transport`: HTTP backend
//! - `api_proxy`: read/write entry point with offline fallback
//! - `mirror/`: independent queue for raw writes
//!
//! When the local store cannot be opened the client degrades to online-only:
//! the proxy stops caching and queueing and there is no orchestrator. The
//! reason is kept on the client and broadcast as `StoreUnavailable` when the
//! background loops start, once subscribers can exist.

pub mod api_proxy;
pub mod local_store;
pub mod mirror;
pub mod offline;
pub mod sync;
pub mod transport;

pub use api_proxy::{ApiProxy, ApiResponse, ResponseSource};
pub use mirror::{MirrorQueue, MirrorRequest};

use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::shared::config::SyncConfig;
use crate::shared::error::SyncError;
use crate::shared::event::{broadcast_event, event_channel, SyncEvent, SyncEventBroadcast};
use local_store::LocalStore;
use offline::{Outbox, ReplayRequester};
use sync::{
    BandwidthMonitor, ConflictLedger, ConflictResolver, NetworkMonitor, NetworkStatus,
    OrchestratorParts, OrchestratorSettings, SyncOrchestrator, SyncPlanner,
};
use transport::HttpBackend;

/// Store-backed half of the client
#[derive(Debug, Clone)]
struct OfflineParts {
    outbox: Outbox,
    ledger: ConflictLedger,
    orchestrator: Arc<SyncOrchestrator>,
}

/// Entry point for applications
#[derive(Debug, Clone)]
pub struct OfflineClient {
    config: Arc<SyncConfig>,
    events: SyncEventBroadcast,
    network: NetworkMonitor,
    backend: HttpBackend,
    proxy: ApiProxy,
    planner: Arc<SyncPlanner>,
    offline: Option<OfflineParts>,
    mirror: Option<MirrorQueue>,
    store_unavailable: Option<String>,
}

impl OfflineClient {
    /// Open the stores under the configured data directory and wire the client
    pub async fn open(config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;

        let store = LocalStore::open(config.store_path()).await.map_err(|e| e.to_string());
        let mut client = Self::assemble(config, store, event_channel())?;

        let mirror_path = client.config.mirror_path();
        match MirrorQueue::open(&mirror_path, client.backend.clone(), client.events.clone()).await {
            Ok(mirror) => client.mirror = Some(mirror),
            Err(e) => tracing::warn!("[Client] Mirror queue disabled: {}", e),
        }

        Ok(client)
    }

    /// Wire the client around an already opened store, without a mirror
    ///
    /// `None` builds an online-only client.
    pub fn open_with_store(config: SyncConfig, store: Option<LocalStore>) -> Result<Self, SyncError> {
        config.validate()?;
        let store = store.ok_or_else(|| "no local store".to_string());
        Self::assemble(config, store, event_channel())
    }

    fn assemble(
        config: SyncConfig,
        store: Result<LocalStore, String>,
        events: SyncEventBroadcast,
    ) -> Result<Self, SyncError> {
        let config = Arc::new(config);
        let backend = HttpBackend::new(config.clone(), Arc::new(BandwidthMonitor::new()))?;
        let network = NetworkMonitor::new(NetworkStatus::Online, events.clone());
        let planner = Arc::new(SyncPlanner::with_defaults(&config.priorities));

        let store = match store {
            Ok(store) => store,
            Err(reason) => {
                tracing::error!("[Client] Local store unavailable, running online-only: {}", reason);
                return Ok(Self {
                    proxy: ApiProxy::online_only(backend.clone(), network.clone()),
                    config,
                    events,
                    network,
                    backend,
                    planner,
                    offline: None,
                    mirror: None,
                    store_unavailable: Some(reason),
                });
            }
        };

        let replay_requested = Arc::new(Notify::new());
        let requester: Arc<dyn ReplayRequester> = replay_requested.clone();
        let outbox = Outbox::new(store, events.clone(), config.default_max_retries)
            .with_replay_requester(requester);
        let ledger = ConflictLedger::new(outbox.clone(), ConflictResolver::with_defaults(), events.clone());

        let orchestrator = Arc::new(SyncOrchestrator::new(OrchestratorParts {
            outbox: outbox.clone(),
            backend: backend.clone(),
            planner: planner.clone(),
            ledger: ledger.clone(),
            settings: OrchestratorSettings::from_config(&config),
            network: network.clone(),
            events: events.clone(),
            replay_requested,
        }));

        Ok(Self {
            proxy: ApiProxy::new(backend.clone(), network.clone(), outbox.clone(), ledger.clone()),
            config,
            events,
            network,
            backend,
            planner,
            offline: Some(OfflineParts {
                outbox,
                ledger,
                orchestrator,
            }),
            mirror: None,
            store_unavailable: None,
        })
    }

    /// Attach a mirror queue
    pub fn with_mirror(mut self, mirror: MirrorQueue) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn proxy(&self) -> &ApiProxy {
        &self.proxy
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn backend(&self) -> &HttpBackend {
        &self.backend
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn events(&self) -> &SyncEventBroadcast {
        &self.events
    }

    pub fn planner(&self) -> &Arc<SyncPlanner> {
        &self.planner
    }

    /// Why the client runs online-only, if it does
    pub fn store_unavailable_reason(&self) -> Option<&str> {
        self.store_unavailable.as_deref()
    }

    /// Whether the local store is available
    pub fn is_offline_capable(&self) -> bool {
        self.offline.is_some()
    }

    pub fn orchestrator(&self) -> Option<&Arc<SyncOrchestrator>> {
        self.offline.as_ref().map(|o| &o.orchestrator)
    }

    pub fn outbox(&self) -> Option<&Outbox> {
        self.offline.as_ref().map(|o| &o.outbox)
    }

    /// Conflict ledger, for the resolution UI
    pub fn conflicts(&self) -> Option<&ConflictLedger> {
        self.offline.as_ref().map(|o| &o.ledger)
    }

    pub fn mirror(&self) -> Option<&MirrorQueue> {
        self.mirror.as_ref()
    }

    /// Start the sync and mirror background loops
    ///
    /// Broadcasts `StoreUnavailable` first when running online-only.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        if let Some(reason) = &self.store_unavailable {
            broadcast_event(
                &self.events,
                SyncEvent::StoreUnavailable {
                    reason: reason.clone(),
                },
            );
        }

        let mut handles = Vec::new();
        if let Some(offline) = &self.offline {
            handles.push(offline.orchestrator.clone().spawn());
        }
        if let Some(mirror) = &self.mirror {
            handles.push(mirror.clone().spawn(self.network.clone()));
        }
        tracing::info!("[Client] Started {} background loop(s)", handles.len());
        handles
    }
}
