//! # Sync Orchestrator
//!
//! Drains the outbox against the network, one cycle at a time.
//!
//! ## Architecture
//!
//! - **Planner**: orders entity types by priority under the current bandwidth
//! - **Retry manager**: in-memory backoff between attempts
//! - **Conflict ledger**: settles `409 Conflict` replies
//! - **Network monitor**: connectivity signal and offline→online trigger
//! - **Sync state**: `watch`-published status snapshot
//! - **Metrics**: cycle counters
//!
//! ## Cycle
//!
//! `Idle → Syncing → Idle`. A request arriving while a cycle runs is coalesced
//! into it: the running cycle makes one more pass before going idle. Each
//! pass reads every pending action and, in plan order, replays it with its
//! original method, payload and idempotency key:
//!
//! - 2xx: the action is removed and its optimistic entity confirmed
//! - otherwise: `retry_count` is incremented; at `max_retries` the action is
//!   moved to dead letters and `ActionDropped` fires once
//!
//! A failed or skipped action blocks the later actions on the same entity
//! key for the rest of the pass, so replay stays FIFO per key. Entities with
//! a `manual` conflict are blocked until the conflict is resolved. A `409`
//! that resolves to `manual` holds the action without spending a retry.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use reliefsync::client::OfflineClient;
//! use reliefsync::shared::SyncConfig;
//!
//! # async fn example() -> Result<(), reliefsync::shared::SyncError> {
//! let client = OfflineClient::open(SyncConfig::default()).await?;
//! if let Some(orchestrator) = client.orchestrator() {
//!     let outcome = orchestrator.sync_now().await?;
//!     println!("sync: {:?}", outcome);
//!     println!("status: {:?}", orchestrator.status());
//! }
//! # Ok(())
//! # }
//! ```

pub mod bandwidth;
pub mod conflict_ledger;
pub mod conflict_resolver;
pub mod metrics;
pub mod network_monitor;
pub mod planner;
pub mod sync_state;

pub use bandwidth::BandwidthMonitor;
pub use conflict_ledger::ConflictLedger;
pub use conflict_resolver::{ConflictResolver, Resolution, ResolutionStrategy};
pub use metrics::{ConflictMetrics, SyncMetrics};
pub use network_monitor::{NetworkMonitor, NetworkStatus};
pub use planner::{SyncPlan, SyncPlanner};
pub use sync_state::{SyncPhase, SyncStatus};

use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Interval;

use crate::client::offline::{OptimisticManager, Outbox, RetryManager};
use crate::client::transport::HttpBackend;
use crate::shared::config::{BackoffConfig, SyncConfig};
use crate::shared::error::SyncError;
use crate::shared::event::{broadcast_event, SyncEvent, SyncEventBroadcast};
use crate::shared::model::{DropReason, HttpMethod, QueuedAction, ResourcePath};

/// Result of a `sync_now` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// This call ran the cycle
    Completed(CycleReport),
    /// A cycle was already running and will cover this request
    Coalesced,
    /// Offline; nothing attempted
    SkippedOffline,
}

/// Counts from one sync cycle (all passes)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub delivered: usize,
    pub failed: usize,
    pub dropped: usize,
    /// Settled by a conflict resolution instead of delivery
    pub conflicts: usize,
    /// Left for a later cycle by the plan, backoff, budget, FIFO blocking or
    /// a pending manual conflict
    pub deferred: usize,
    pub remaining: usize,
    pub bytes_sent: u64,
    pub last_error: Option<String>,
}

impl CycleReport {
    fn absorb(&mut self, pass: CycleReport) {
        self.delivered += pass.delivered;
        self.failed += pass.failed;
        self.dropped += pass.dropped;
        self.conflicts += pass.conflicts;
        self.deferred = pass.deferred;
        self.remaining = pass.remaining;
        self.bytes_sent += pass.bytes_sent;
        if pass.last_error.is_some() {
            self.last_error = pass.last_error;
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

enum Delivery {
    Delivered,
    Failed(String),
    Dropped,
    Conflict,
}

/// Outbox drain coordinator
#[derive(Debug)]
pub struct SyncOrchestrator {
    outbox: Outbox,
    backend: HttpBackend,
    planner: Arc<SyncPlanner>,
    ledger: ConflictLedger,
    optimistic: OptimisticManager,
    retry: RetryManager,
    network: NetworkMonitor,
    events: SyncEventBroadcast,
    status: watch::Sender<SyncStatus>,
    metrics: RwLock<SyncMetrics>,
    /// Held for the duration of a cycle
    sync_lock: Mutex<()>,
    rerun: AtomicBool,
    replay_requested: Arc<Notify>,
    bandwidth_aware: bool,
    sync_interval: Option<Duration>,
}

/// Parts the orchestrator is built from
#[derive(Debug, Clone)]
pub struct OrchestratorParts {
    pub outbox: Outbox,
    pub backend: HttpBackend,
    pub planner: Arc<SyncPlanner>,
    pub ledger: ConflictLedger,
    pub settings: OrchestratorSettings,
    pub network: NetworkMonitor,
    pub events: SyncEventBroadcast,
    pub replay_requested: Arc<Notify>,
}

/// Backoff and scheduling knobs taken from the config
#[derive(Debug, Clone, Default)]
pub struct OrchestratorSettings {
    pub backoff: BackoffConfig,
    pub bandwidth_aware: bool,
    pub sync_interval: Option<Duration>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            backoff: config.backoff.clone(),
            bandwidth_aware: config.bandwidth_aware,
            sync_interval: config.sync_interval(),
        }
    }
}

impl SyncOrchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        let initial = SyncStatus {
            network: parts.network.get_status(),
            ..SyncStatus::default()
        };
        let (status, _) = watch::channel(initial);

        Self {
            optimistic: OptimisticManager::new(parts.outbox.store().clone()),
            outbox: parts.outbox,
            backend: parts.backend,
            planner: parts.planner,
            ledger: parts.ledger,
            retry: RetryManager::new(parts.settings.backoff),
            network: parts.network,
            events: parts.events,
            status,
            metrics: RwLock::new(SyncMetrics::new()),
            sync_lock: Mutex::new(()),
            rerun: AtomicBool::new(false),
            replay_requested: parts.replay_requested,
            bandwidth_aware: parts.settings.bandwidth_aware,
            sync_interval: parts.settings.sync_interval,
        }
    }

    /// Current status snapshot
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub async fn metrics(&self) -> SyncMetrics {
        self.metrics.read().await.clone()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn ledger(&self) -> &ConflictLedger {
        &self.ledger
    }

    pub fn planner(&self) -> &Arc<SyncPlanner> {
        &self.planner
    }

    pub fn is_syncing(&self) -> bool {
        self.sync_lock.try_lock().is_err()
    }

    /// Run a sync cycle now, or fold this request into the running one
    pub async fn sync_now(&self) -> Result<SyncOutcome, SyncError> {
        if !self.network.is_online() {
            tracing::debug!("[Sync] Offline, skipping sync");
            return Ok(SyncOutcome::SkippedOffline);
        }

        let Ok(_guard) = self.sync_lock.try_lock() else {
            self.rerun.store(true, Ordering::SeqCst);
            tracing::debug!("[Sync] Cycle in progress, request coalesced");
            return Ok(SyncOutcome::Coalesced);
        };

        self.metrics.write().await.record_cycle_start();
        self.set_phase(SyncPhase::Syncing);
        tracing::info!("[Sync] Cycle started");

        let mut report = CycleReport::default();
        loop {
            self.rerun.store(false, Ordering::SeqCst);

            match self.run_pass().await {
                Ok(pass) => report.absorb(pass),
                Err(e) => {
                    tracing::error!("[Sync] Cycle aborted: {}", e);
                    self.metrics
                        .write()
                        .await
                        .record_cycle_failure(report.delivered as u64, report.bytes_sent);
                    report.last_error = Some(e.to_string());
                    self.finish(&mut report).await;
                    return Err(e);
                }
            }

            if !self.rerun.swap(false, Ordering::SeqCst) || !self.network.is_online() {
                break;
            }
            tracing::debug!("[Sync] Running coalesced pass");
        }

        {
            let mut metrics = self.metrics.write().await;
            if report.is_clean() {
                metrics.record_cycle_success(report.delivered as u64, report.bytes_sent);
            } else {
                metrics.record_cycle_failure(report.delivered as u64, report.bytes_sent);
            }
        }
        self.finish(&mut report).await;

        Ok(SyncOutcome::Completed(report))
    }

    async fn run_pass(&self) -> Result<CycleReport, SyncError> {
        let mut report = CycleReport::default();

        let pending = self.outbox.list_pending().await?;
        if pending.is_empty() {
            return Ok(report);
        }

        let estimate = self.backend.bandwidth().estimate().await;
        let last_synced = self.outbox.store().last_synced_by_type().await?;
        let plan = self
            .planner
            .plan(&pending, estimate, &last_synced, Utc::now(), self.bandwidth_aware)
            .await;

        tracing::info!(
            "[Sync] {} pending, plan {:?} ({:?} link, ~{:.1}s), deferred {:?}",
            pending.len(),
            plan.entity_types(),
            estimate.speed_class,
            plan.total_estimated_secs,
            plan.deferred
        );

        let by_id: HashMap<i64, &QueuedAction> = pending.iter().map(|a| (a.id, a)).collect();
        report.deferred += pending
            .iter()
            .filter(|a| plan.deferred.contains(&a.entity_type))
            .count();

        // Writes under a manual conflict wait for resolve_conflict
        let mut blocked: HashSet<String> = self.ledger.pending_entity_keys().await?;
        if !blocked.is_empty() {
            tracing::debug!("[Sync] Holding writes for {} conflicted entities", blocked.len());
        }

        for entry in &plan.entries {
            let mut sent_bytes = 0u64;
            let mut delivered_any = false;

            for id in &entry.action_ids {
                let Some(planned) = by_id.get(id) else { continue };
                if blocked.contains(&planned.entity_key) {
                    report.deferred += 1;
                    continue;
                }
                if !self.retry.is_ready(*id).await {
                    blocked.insert(planned.entity_key.clone());
                    report.deferred += 1;
                    continue;
                }

                let size = planned.estimated_size();
                if sent_bytes > 0 && sent_bytes + size > entry.max_bytes_per_cycle {
                    blocked.insert(planned.entity_key.clone());
                    report.deferred += 1;
                    continue;
                }

                // Cancelled or superseded since the pass started
                let Some(action) = self.outbox.get(*id).await? else { continue };
                sent_bytes += size;

                match self.deliver(&action).await? {
                    Delivery::Delivered => {
                        report.delivered += 1;
                        delivered_any = true;
                    }
                    Delivery::Conflict => {
                        report.conflicts += 1;
                        blocked.insert(action.entity_key.clone());
                    }
                    Delivery::Failed(error) => {
                        report.failed += 1;
                        report.last_error = Some(error);
                        blocked.insert(action.entity_key.clone());
                    }
                    Delivery::Dropped => {
                        report.failed += 1;
                        report.dropped += 1;
                        blocked.insert(action.entity_key.clone());
                    }
                }
            }

            report.bytes_sent += sent_bytes;
            if delivered_any {
                self.outbox
                    .store()
                    .set_last_synced_at(&entry.entity_type, Utc::now())
                    .await?;
            }
        }

        report.remaining = self.outbox.count_pending().await? as usize;
        Ok(report)
    }

    async fn deliver(&self, action: &QueuedAction) -> Result<Delivery, SyncError> {
        let body = (!action.payload.is_null()).then_some(&action.payload);
        let response = self
            .backend
            .send(action.method, &action.target, body, Some(action.idempotency_key))
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return self.fail(action, e.to_string()).await,
        };

        if response.is_success() {
            self.outbox.remove(action.id).await?;
            self.retry.cancel_retry(action.id).await;

            let local_id = action.local_entity_id.clone().or_else(|| {
                ResourcePath::parse(&action.target).and_then(|p| p.entity_id)
            });
            self.optimistic
                .confirm(&action.entity_type, local_id.as_deref(), action.method, &response.body)
                .await?;

            tracing::info!("[Sync] Delivered action {} {} {}", action.id, action.method, action.target);
            return Ok(Delivery::Delivered);
        }

        if response.status == 409 && action.method != HttpMethod::Delete {
            if let Some(entity_id) = self.conflict_entity_id(action) {
                let server_value = conflict_server_value(&response.body);
                let record = self
                    .ledger
                    .handle_divergence(&action.entity_type, &entity_id, action.payload.clone(), server_value)
                    .await?;

                if self.outbox.get(action.id).await?.is_none() {
                    self.retry.cancel_retry(action.id).await;
                    return Ok(Delivery::Conflict);
                }
                if record.is_pending() {
                    self.retry.cancel_retry(action.id).await;
                    tracing::info!(
                        "[Sync] Action {} held by manual conflict {}",
                        action.id,
                        record.id
                    );
                    return Ok(Delivery::Conflict);
                }
            }
        }

        self.fail(action, response.error_summary()).await
    }

    async fn fail(&self, action: &QueuedAction, error: String) -> Result<Delivery, SyncError> {
        let Some(updated) = self.outbox.record_failure(action.id).await? else {
            return Ok(Delivery::Failed(error));
        };

        if updated.is_exhausted() {
            self.retry.cancel_retry(updated.id).await;
            self.outbox
                .drop_to_dead_letter(updated, DropReason::RetriesExhausted, Some(error))
                .await?;
            self.metrics.write().await.record_dropped();
            return Ok(Delivery::Dropped);
        }

        self.retry.schedule_retry(updated.id, updated.retry_count).await;
        Ok(Delivery::Failed(error))
    }

    fn conflict_entity_id(&self, action: &QueuedAction) -> Option<String> {
        ResourcePath::parse(&action.target)
            .and_then(|p| p.entity_id)
            .or_else(|| action.local_entity_id.clone())
    }

    fn set_phase(&self, phase: SyncPhase) {
        let network = self.network.get_status();
        self.status.send_modify(|status| {
            status.phase = phase;
            status.network = network;
        });
    }

    async fn finish(&self, report: &mut CycleReport) {
        let dead_letters = self.outbox.list_dead_letters().await.map(|l| l.len() as u64);
        if let Ok(remaining) = self.outbox.count_pending().await {
            report.remaining = remaining as usize;
        }
        let backing_off = self.retry.count_waiting().await as u64;
        let bandwidth_samples = self.backend.bandwidth().sample_count().await as u64;

        let network = self.network.get_status();
        self.status.send_modify(|status| {
            status.phase = SyncPhase::Idle;
            status.last_sync = Some(Utc::now());
            status.pending_actions = report.remaining as u64;
            if let Ok(count) = dead_letters {
                status.dead_letters = count;
            }
            status.backing_off = backing_off;
            status.bandwidth_samples = bandwidth_samples;
            status.network = network;
            status.last_error = report.last_error.clone();
        });

        let event = if report.is_clean() && report.last_error.is_none() {
            tracing::info!(
                "[Sync] Cycle complete: {} delivered, {} remaining",
                report.delivered,
                report.remaining
            );
            SyncEvent::SyncComplete {
                delivered: report.delivered,
                remaining: report.remaining,
            }
        } else {
            tracing::warn!(
                "[Sync] Cycle failed: {} delivered, {} failed, {} remaining",
                report.delivered,
                report.failed,
                report.remaining
            );
            SyncEvent::SyncFailed {
                delivered: report.delivered,
                failed: report.failed,
                remaining: report.remaining,
                error: report.last_error.clone(),
            }
        };
        broadcast_event(&self.events, event);
    }

    /// Run the trigger loop in the background
    ///
    /// Triggers: offline→online transitions, replay requests from the
    /// outbox, mirror replay completion and the optional periodic timer.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let mut network_rx = self.network.subscribe();
        let mut events_rx = self.events.subscribe();

        tokio::spawn(async move {
            let mut interval = self.sync_interval.map(|period| {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                interval
            });

            tracing::info!("[Sync] Background loop started");
            loop {
                let trigger = tokio::select! {
                    changed = network_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if !network_rx.borrow_and_update().is_online() {
                            continue;
                        }
                        "connectivity restored"
                    }
                    _ = self.replay_requested.notified() => "replay requested",
                    event = events_rx.recv() => match event {
                        Ok(SyncEvent::MirrorReplayComplete { .. }) => "mirror replay complete",
                        Ok(_) | Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    },
                    _ = tick(&mut interval) => "interval",
                };

                tracing::debug!("[Sync] Triggered: {}", trigger);
                if let Err(e) = self.sync_now().await {
                    tracing::error!("[Sync] Sync cycle failed: {}", e);
                }
            }
            tracing::info!("[Sync] Background loop stopped");
        })
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Server value carried by a `409` body: `current` or `server` when present
fn conflict_server_value(body: &Value) -> Value {
    body.get("current")
        .or_else(|| body.get("server"))
        .cloned()
        .unwrap_or_else(|| body.clone())
}
