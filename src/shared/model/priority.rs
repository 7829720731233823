//! Sync priorities and bandwidth estimates.

use serde::{Deserialize, Serialize};

/// Below this rate the link is `slow` (bytes per second)
pub const SLOW_BYTES_PER_SECOND: f64 = 50_000.0;

/// At or above this rate the link is `fast` (bytes per second)
pub const FAST_BYTES_PER_SECOND: f64 = 500_000.0;

/// Per-entity-type scheduling weight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPriorityEntry {
    pub entity_type: String,
    /// Higher syncs sooner
    pub priority: u8,
    /// Payload budget per sync cycle
    pub max_bytes_per_cycle: u64,
    /// Minimum time between two syncs of this type
    pub min_interval_ms: u64,
}

impl SyncPriorityEntry {
    pub fn new(
        entity_type: impl Into<String>,
        priority: u8,
        max_bytes_per_cycle: u64,
        min_interval_ms: u64,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            priority,
            max_bytes_per_cycle,
            min_interval_ms,
        }
    }
}

/// Coarse speed bucket driving sync prioritization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedClass {
    Slow,
    Medium,
    Fast,
}

impl SpeedClass {
    pub fn classify(bytes_per_second: f64) -> Self {
        if bytes_per_second < SLOW_BYTES_PER_SECOND {
            SpeedClass::Slow
        } else if bytes_per_second < FAST_BYTES_PER_SECOND {
            SpeedClass::Medium
        } else {
            SpeedClass::Fast
        }
    }

    /// Lowest priority synced under this class
    pub fn min_priority(&self) -> u8 {
        match self {
            SpeedClass::Slow => 8,
            SpeedClass::Medium => 5,
            SpeedClass::Fast => 0,
        }
    }
}

/// Advisory bandwidth estimate; never authoritative
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandwidthEstimate {
    pub bytes_per_second: f64,
    pub speed_class: SpeedClass,
}

impl BandwidthEstimate {
    pub fn from_bytes_per_second(bytes_per_second: f64) -> Self {
        Self {
            bytes_per_second,
            speed_class: SpeedClass::classify(bytes_per_second),
        }
    }

    /// Estimate used before any transfer has been observed
    pub fn assumed_fast() -> Self {
        Self::from_bytes_per_second(FAST_BYTES_PER_SECOND * 2.0)
    }
}
