//! # Sync Metrics
//!
//! Running counters for sync cycles and conflict resolution. Both are
//! exposed to callers as read-only snapshots.

use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncMetrics {
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub delivered_actions: u64,
    pub dropped_actions: u64,
    pub total_bytes_sent: u64,
    pub average_cycle_duration: Duration,
    pub last_cycle_duration: Option<Duration>,
    #[serde(skip)]
    last_cycle_start: Option<Instant>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle_start(&mut self) {
        self.last_cycle_start = Some(Instant::now());
        self.total_cycles += 1;
    }

    pub fn record_cycle_success(&mut self, delivered: u64, bytes_sent: u64) {
        self.successful_cycles += 1;
        self.record_cycle_end(delivered, bytes_sent);
    }

    pub fn record_cycle_failure(&mut self, delivered: u64, bytes_sent: u64) {
        self.failed_cycles += 1;
        self.record_cycle_end(delivered, bytes_sent);
    }

    pub fn record_dropped(&mut self) {
        self.dropped_actions += 1;
    }

    fn record_cycle_end(&mut self, delivered: u64, bytes_sent: u64) {
        self.delivered_actions += delivered;
        self.total_bytes_sent += bytes_sent;

        if let Some(start) = self.last_cycle_start.take() {
            let duration = start.elapsed();
            self.last_cycle_duration = Some(duration);

            // Rolling average over finished cycles
            let finished = (self.successful_cycles + self.failed_cycles).max(1) as u32;
            self.average_cycle_duration =
                (self.average_cycle_duration * (finished - 1) + duration) / finished;
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_cycles == 0 {
            0.0
        } else {
            self.successful_cycles as f64 / self.total_cycles as f64
        }
    }
}

/// Conflict resolution counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConflictMetrics {
    pub total_conflicts: u64,
    pub auto_resolved: u64,
    pub manually_resolved: u64,
    /// Detection-to-resolution time summed over resolved conflicts
    pub cumulative_resolution_latency: Duration,
}

impl ConflictMetrics {
    pub fn record_detected(&mut self) {
        self.total_conflicts += 1;
    }

    pub fn record_auto_resolved(&mut self, latency: Duration) {
        self.auto_resolved += 1;
        self.cumulative_resolution_latency += latency;
    }

    pub fn record_manually_resolved(&mut self, latency: Duration) {
        self.manually_resolved += 1;
        self.cumulative_resolution_latency += latency;
    }

    /// Conflicts still waiting for a decision
    pub fn pending(&self) -> u64 {
        self.total_conflicts
            .saturating_sub(self.auto_resolved + self.manually_resolved)
    }
}
