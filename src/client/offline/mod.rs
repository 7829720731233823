//! # Offline Writes
//!
//! Everything a write goes through when it cannot reach the server:
//!
//! - `outbox.rs`: durable queue of deferred writes and the dead-letter partition
//! - `optimistic.rs`: optimistic entities in `local_data`
//! - `retry.rs`: in-memory backoff between delivery attempts

pub mod optimistic;
pub mod outbox;
pub mod retry;

pub use optimistic::OptimisticManager;
pub use outbox::{NewAction, Outbox, ReplayRequester};
pub use retry::RetryManager;
