//! Shared Module
//!
//! Types shared by every component of the sync subsystem. None of these types
//! perform I/O; they describe the persisted records, configuration, events
//! and errors the client components exchange.

/// Persisted record types
pub mod model;

/// Sync lifecycle events
pub mod event;

/// Shared error types
pub mod error;

/// Sync configuration
pub mod config;

/// Re-export commonly used types for convenience
pub use config::{BackoffConfig, ConfigError, SyncConfig, SyncConfigBuilder};
pub use error::SyncError;
pub use event::SyncEvent;
pub use model::{
    ActionKind, BandwidthEstimate, CachedResponse, ConflictRecord, DeadLetter, HttpMethod,
    LocalEntity, QueuedAction, ResolutionKind, SpeedClass, SyncPriorityEntry,
};
