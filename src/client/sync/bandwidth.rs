//! # Bandwidth Estimation
//!
//! Rolling window of observed transfers. The estimate only orders sync work;
//! a wrong estimate never affects what gets delivered.
//!
//! Transfers under [`MIN_SAMPLE_BYTES`] are ignored: a small JSON exchange is
//! dominated by round-trip latency and says nothing about throughput.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::shared::model::BandwidthEstimate;

/// Samples kept in the rolling window
pub const DEFAULT_WINDOW: usize = 20;

/// Smallest transfer counted as a sample
pub const MIN_SAMPLE_BYTES: u64 = 16 * 1024;

/// Shortest transfer time counted, avoids division blow-ups on tiny bodies
const MIN_SAMPLE_DURATION: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSample {
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Estimates throughput from recent transfer timings
#[derive(Debug)]
pub struct BandwidthMonitor {
    samples: RwLock<VecDeque<TransferSample>>,
    window: usize,
}

impl BandwidthMonitor {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            samples: RwLock::new(VecDeque::with_capacity(window)),
            window: window.max(1),
        }
    }

    /// Record one completed transfer
    pub async fn record(&self, bytes: u64, elapsed: Duration) {
        if bytes < MIN_SAMPLE_BYTES {
            return;
        }
        let mut samples = self.samples.write().await;
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(TransferSample {
            bytes,
            elapsed: elapsed.max(MIN_SAMPLE_DURATION),
        });
    }

    /// Current estimate; `fast` until something has been observed
    pub async fn estimate(&self) -> BandwidthEstimate {
        let samples = self.samples.read().await;
        if samples.is_empty() {
            return BandwidthEstimate::assumed_fast();
        }

        let bytes: u64 = samples.iter().map(|s| s.bytes).sum();
        let secs: f64 = samples.iter().map(|s| s.elapsed.as_secs_f64()).sum();
        BandwidthEstimate::from_bytes_per_second(bytes as f64 / secs)
    }

    pub async fn sample_count(&self) -> usize {
        self.samples.read().await.len()
    }
}

impl Default for BandwidthMonitor {
    fn default() -> Self {
        Self::new()
    }
}
