//! ReliefSync - Offline-First Sync Library
//!
//! ReliefSync is the client-side synchronization layer of a disaster-relief
//! coordination platform. It lets field workers keep working while the
//! network is unreliable: writes are queued durably, replayed once
//! connectivity returns, and divergent local/server state is reconciled
//! through per-entity-type policies instead of being silently overwritten.
//!
//! # Module Structure
//!
//! - **`shared`** - Platform-agnostic types
//!   - Data model (queued actions, cached responses, local entities, conflicts)
//!   - Configuration, lifecycle events and error types
//!
//! - **`client`** - The offline-first subsystem
//!   - Durable local store on SQLite
//!   - Mutation outbox with bounded retry and dead letters
//!   - Sync orchestrator, selective sync planner, conflict resolution
//!   - Network-boundary API proxy
//!   - Background mirror queue with its own storage
//!
//! # Usage
//!
//! ```rust,no_run
//! use reliefsync::client::OfflineClient;
//! use reliefsync::shared::config::SyncConfig;
//!
//! # async fn example() -> Result<(), reliefsync::shared::SyncError> {
//! let config = SyncConfig::builder()
//!     .server_url("https://relief.example.org/api")
//!     .build()?;
//! let client = OfflineClient::open(config).await?;
//!
//! // Works online or offline; offline writes come back provisional.
//! let response = client.proxy().post("/needs", serde_json::json!({"title": "Water"})).await?;
//! if response.is_provisional() {
//!     println!("queued as action {:?}", response.action_id);
//! }
//!
//! // Drain the outbox once connectivity returns.
//! client.network().set_online(true);
//! if let Some(orchestrator) = client.orchestrator() {
//!     orchestrator.sync_now().await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Delivery Semantics
//!
//! Delivery is at-least-once. Every mutation carries an idempotency key so
//! the server can deduplicate replays coming from either the outbox or the
//! mirror queue.

/// Shared types and data structures
pub mod shared;

/// Offline-first client subsystem
pub mod client;
