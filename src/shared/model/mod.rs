//! # Data Model
//!
//! Records persisted by the durable local store and exchanged between the
//! outbox, orchestrator, conflict engine and planner.
//!
//! - `action.rs`: queued write operations and dead letters
//! - `cache.rs`: memoized GET responses
//! - `entity.rs`: the client's working copy of domain records
//! - `conflict.rs`: detected local/server divergences
//! - `priority.rs`: sync priorities and bandwidth estimates
//! - `path.rs`: resource path parsing (entity type / entity id)

pub mod action;
pub mod cache;
pub mod conflict;
pub mod entity;
pub mod path;
pub mod priority;

pub use action::{ActionKind, DeadLetter, DropReason, HttpMethod, QueuedAction};
pub use cache::CachedResponse;
pub use conflict::{ConflictRecord, ResolutionKind};
pub use entity::LocalEntity;
pub use path::ResourcePath;
pub use priority::{BandwidthEstimate, SpeedClass, SyncPriorityEntry};
