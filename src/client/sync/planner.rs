//! # Selective Sync Planner
//!
//! Orders pending work by entity-type priority and caps what one cycle sends
//! per type. The planner only shapes throughput: whatever it leaves out stays
//! in the outbox for a later cycle.
//!
//! Bandwidth policy (when bandwidth-aware):
//!
//! | speed class | synced priorities |
//! |-------------|-------------------|
//! | slow        | >= 8              |
//! | medium      | >= 5              |
//! | fast        | all               |
//!
//! The floor never starves a type: when nothing clears it, every type below
//! it is planned, and a type held back for [`MAX_DEFERRED_PLANS`] plans in a
//! row is planned regardless of the floor.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::shared::model::{BandwidthEstimate, QueuedAction, SyncPriorityEntry};

/// Priority of types without a registered entry
pub const DEFAULT_PRIORITY: u8 = 5;

/// Per-cycle budget of types without a registered entry
pub const DEFAULT_MAX_BYTES_PER_CYCLE: u64 = 1024 * 1024;

/// Consecutive plans a type may be held back before it bypasses the floor
pub const MAX_DEFERRED_PLANS: u32 = 5;

/// Built-in priorities for relief entity types
pub fn default_priorities() -> Vec<SyncPriorityEntry> {
    vec![
        SyncPriorityEntry::new("needs", 10, 512 * 1024, 0),
        SyncPriorityEntry::new("tasks", 8, 512 * 1024, 0),
        SyncPriorityEntry::new("inventory", 7, 256 * 1024, 0),
        SyncPriorityEntry::new("volunteers", 6, 256 * 1024, 30_000),
        SyncPriorityEntry::new("reports", 4, 2 * 1024 * 1024, 60_000),
        SyncPriorityEntry::new("budgets", 3, 128 * 1024, 300_000),
        SyncPriorityEntry::new("profiles", 2, 64 * 1024, 300_000),
    ]
}

/// Work planned for one entity type
#[derive(Debug, Clone, PartialEq)]
pub struct PlanEntry {
    pub entity_type: String,
    pub priority: u8,
    /// Pending actions of this type, in enqueue order
    pub action_ids: Vec<i64>,
    /// Serialized payload size, capped at `max_bytes_per_cycle`
    pub estimated_bytes: u64,
    pub max_bytes_per_cycle: u64,
}

/// Ordered sync work for one cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPlan {
    /// Highest priority first
    pub entries: Vec<PlanEntry>,
    /// Types with pending work left for a later cycle
    pub deferred: Vec<String>,
    pub total_estimated_bytes: u64,
    pub total_estimated_secs: f64,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entity_types(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.entity_type.as_str()).collect()
    }
}

/// Registry of per-type priorities
#[derive(Debug)]
pub struct SyncPlanner {
    entries: RwLock<HashMap<String, SyncPriorityEntry>>,
    /// Consecutive plans each type was deferred in
    deferred_streaks: RwLock<HashMap<String, u32>>,
}

impl SyncPlanner {
    /// Planner with no registered types
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            deferred_streaks: RwLock::new(HashMap::new()),
        }
    }

    /// Planner seeded with the built-in priorities, then `overrides`
    pub fn with_defaults(overrides: &[SyncPriorityEntry]) -> Self {
        let entries = default_priorities()
            .into_iter()
            .chain(overrides.iter().cloned())
            .map(|e| (e.entity_type.clone(), e))
            .collect();

        Self {
            entries: RwLock::new(entries),
            deferred_streaks: RwLock::new(HashMap::new()),
        }
    }

    /// Register or replace the entry for a type
    pub async fn register(&self, entry: SyncPriorityEntry) {
        tracing::debug!(
            "[Planner] Registered {} with priority {}",
            entry.entity_type,
            entry.priority
        );
        self.entries
            .write()
            .await
            .insert(entry.entity_type.clone(), entry);
    }

    /// Entry for a type, falling back to the defaults for unknown types
    pub async fn entry_for(&self, entity_type: &str) -> SyncPriorityEntry {
        self.entries
            .read()
            .await
            .get(entity_type)
            .cloned()
            .unwrap_or_else(|| fallback_entry(entity_type))
    }

    /// Plan one pass and age the types it leaves out
    pub async fn plan(
        &self,
        pending: &[QueuedAction],
        estimate: BandwidthEstimate,
        last_synced: &HashMap<String, DateTime<Utc>>,
        now: DateTime<Utc>,
        bandwidth_aware: bool,
    ) -> SyncPlan {
        let mut streaks = self.deferred_streaks.write().await;
        let aged: HashSet<String> = streaks
            .iter()
            .filter(|(_, count)| **count >= MAX_DEFERRED_PLANS)
            .map(|(entity_type, _)| entity_type.clone())
            .collect();

        let plan = {
            let entries = self.entries.read().await;
            build_plan(&entries, pending, estimate, last_synced, now, bandwidth_aware, &aged)
        };

        for entry in &plan.entries {
            if aged.contains(&entry.entity_type) {
                tracing::info!("[Planner] {} planned after {} deferred plans", entry.entity_type, MAX_DEFERRED_PLANS);
            }
            streaks.remove(&entry.entity_type);
        }
        for entity_type in &plan.deferred {
            *streaks.entry(entity_type.clone()).or_default() += 1;
        }
        streaks.retain(|entity_type, _| pending.iter().any(|a| &a.entity_type == entity_type));

        plan
    }
}

impl Default for SyncPlanner {
    fn default() -> Self {
        Self::with_defaults(&[])
    }
}

fn fallback_entry(entity_type: &str) -> SyncPriorityEntry {
    SyncPriorityEntry::new(entity_type, DEFAULT_PRIORITY, DEFAULT_MAX_BYTES_PER_CYCLE, 0)
}

/// Build a plan from a registry snapshot
///
/// Groups `pending` by entity type, drops types still inside their
/// `min_interval_ms` or below the speed class's priority floor, and sorts
/// the rest by descending priority (ties by type name). Types in `aged`
/// ignore the floor. If the floor would leave the plan empty, the types it
/// held back are planned anyway.
pub fn build_plan(
    registry: &HashMap<String, SyncPriorityEntry>,
    pending: &[QueuedAction],
    estimate: BandwidthEstimate,
    last_synced: &HashMap<String, DateTime<Utc>>,
    now: DateTime<Utc>,
    bandwidth_aware: bool,
    aged: &HashSet<String>,
) -> SyncPlan {
    let mut groups: HashMap<&str, Vec<&QueuedAction>> = HashMap::new();
    for action in pending {
        groups.entry(action.entity_type.as_str()).or_default().push(action);
    }

    let min_priority = if bandwidth_aware {
        estimate.speed_class.min_priority()
    } else {
        0
    };

    let mut plan = SyncPlan::default();
    let mut below_floor = Vec::new();
    for (entity_type, actions) in groups {
        let entry = registry
            .get(entity_type)
            .cloned()
            .unwrap_or_else(|| fallback_entry(entity_type));

        let too_soon = last_synced.get(entity_type).is_some_and(|at| {
            now.signed_duration_since(*at).num_milliseconds() < entry.min_interval_ms as i64
        });

        if too_soon {
            plan.deferred.push(entity_type.to_string());
        } else if entry.priority < min_priority && !aged.contains(entity_type) {
            below_floor.push((entry, actions));
        } else {
            plan.entries.push(plan_entry(entry, actions));
        }
    }

    if plan.entries.is_empty() {
        plan.entries
            .extend(below_floor.into_iter().map(|(entry, actions)| plan_entry(entry, actions)));
    } else {
        plan.deferred
            .extend(below_floor.into_iter().map(|(entry, _)| entry.entity_type));
    }

    plan.entries.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.entity_type.cmp(&b.entity_type))
    });
    plan.deferred.sort();

    plan.total_estimated_bytes = plan.entries.iter().map(|e| e.estimated_bytes).sum();
    plan.total_estimated_secs = if estimate.bytes_per_second > 0.0 {
        plan.total_estimated_bytes as f64 / estimate.bytes_per_second
    } else {
        0.0
    };

    plan
}

fn plan_entry(entry: SyncPriorityEntry, mut actions: Vec<&QueuedAction>) -> PlanEntry {
    actions.sort_by_key(|a| a.id);
    let total: u64 = actions.iter().map(|a| a.estimated_size()).sum();

    PlanEntry {
        priority: entry.priority,
        action_ids: actions.iter().map(|a| a.id).collect(),
        estimated_bytes: total.min(entry.max_bytes_per_cycle),
        max_bytes_per_cycle: entry.max_bytes_per_cycle,
        entity_type: entry.entity_type,
    }
}
