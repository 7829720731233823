//! # Retry Backoff
//!
//! Decides when a failed action may be attempted again. Next-attempt times
//! live in memory only: they are never persisted and never written back to
//! the action, so a restart simply makes every action eligible again.
//!
//! The retry *count* is not tracked here; it lives on the persisted action
//! and bounds the number of delivery attempts.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::shared::config::BackoffConfig;

/// Tracks per-action next-attempt times
#[derive(Debug)]
pub struct RetryManager {
    /// Earliest next attempt per action id
    next_attempt: RwLock<HashMap<i64, Instant>>,
    strategy: BackoffConfig,
}

impl RetryManager {
    /// Create a new retry manager
    pub fn new(strategy: BackoffConfig) -> Self {
        Self {
            next_attempt: RwLock::new(HashMap::new()),
            strategy,
        }
    }

    /// Delay before the next attempt after `retry_count` failures
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        match self.strategy {
            BackoffConfig::Immediate => Duration::ZERO,
            BackoffConfig::Fixed { interval_ms } => Duration::from_millis(interval_ms),
            BackoffConfig::Exponential { base_ms, max_ms } => {
                let exponent = retry_count.saturating_sub(1).min(32);
                let delay = base_ms.saturating_mul(1u64 << exponent);
                Duration::from_millis(delay.min(max_ms))
            }
        }
    }

    /// Record a failure; the action becomes eligible after the backoff delay
    pub async fn schedule_retry(&self, action_id: i64, retry_count: u32) {
        let delay = self.delay_for(retry_count);
        if delay.is_zero() {
            self.next_attempt.write().await.remove(&action_id);
            return;
        }

        self.next_attempt
            .write()
            .await
            .insert(action_id, Instant::now() + delay);
        tracing::debug!("[Retry] Action {} backs off for {:?}", action_id, delay);
    }

    /// Whether the action may be attempted now
    pub async fn is_ready(&self, action_id: i64) -> bool {
        match self.next_attempt.read().await.get(&action_id) {
            Some(at) => *at <= Instant::now(),
            None => true,
        }
    }

    /// Forget an action (delivered, dropped or cancelled)
    pub async fn cancel_retry(&self, action_id: i64) {
        self.next_attempt.write().await.remove(&action_id);
    }

    /// Count actions currently backing off
    pub async fn count_waiting(&self) -> usize {
        let now = Instant::now();
        self.next_attempt
            .read()
            .await
            .values()
            .filter(|at| **at > now)
            .count()
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
