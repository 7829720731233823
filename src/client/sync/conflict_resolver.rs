//! # Conflict Resolution Engine
//!
//! Decides, per entity type, how a local mutation and a freshly observed
//! server value are reconciled. Resolution is a pure function of
//! `(entity_type, local, server)`: the only time input is the timestamps
//! embedded in the payloads.
//!
//! ## Default policy table
//!
//! | entity type              | strategy                                 |
//! |--------------------------|------------------------------------------|
//! | `needs`                  | last write wins                          |
//! | `tasks`, `volunteers`    | critical-field merge (status, assignee)  |
//! | `inventory`              | quantity merge, threshold 10             |
//! | `profiles`, `users`      | server authoritative                     |
//! | anything else            | manual                                   |

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::shared::model::ResolutionKind;

/// Payload fields searched, in order, for the mutation timestamp
pub const TIMESTAMP_FIELDS: [&str; 4] = ["updated_at", "updatedAt", "modified_at", "timestamp"];

/// Absolute quantity divergence above which inventory is a timestamp conflict
pub const DEFAULT_QUANTITY_THRESHOLD: f64 = 10.0;

/// Outcome of a resolution
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Local,
    Server,
    Merge(Value),
    /// Left for a human decision
    Manual,
}

impl Resolution {
    pub fn kind(&self) -> ResolutionKind {
        match self {
            Resolution::Local => ResolutionKind::Local,
            Resolution::Server => ResolutionKind::Server,
            Resolution::Merge(_) => ResolutionKind::Merge,
            Resolution::Manual => ResolutionKind::Manual,
        }
    }

    pub fn merged_payload(&self) -> Option<&Value> {
        match self {
            Resolution::Merge(value) => Some(value),
            _ => None,
        }
    }
}

/// Caller-supplied resolution function: `(entity_id, local, server)`
pub type CustomResolver = Arc<dyn Fn(&str, &Value, &Value) -> Resolution + Send + Sync>;

/// How conflicts of one entity type are settled
#[derive(Clone)]
pub enum ResolutionStrategy {
    /// Newer embedded timestamp wins; ties and missing timestamps go to server
    LastWriteWins,
    /// Timestamp comparison if any critical field differs, field merge otherwise
    CriticalFieldMerge { critical_fields: Vec<String> },
    /// Max of quantity fields unless they diverge by more than `threshold`
    QuantityMerge {
        quantity_fields: Vec<String>,
        threshold: f64,
    },
    ServerAuthoritative,
    Manual,
    Custom(CustomResolver),
}

impl ResolutionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ResolutionStrategy::LastWriteWins => "last_write_wins",
            ResolutionStrategy::CriticalFieldMerge { .. } => "critical_field_merge",
            ResolutionStrategy::QuantityMerge { .. } => "quantity_merge",
            ResolutionStrategy::ServerAuthoritative => "server_authoritative",
            ResolutionStrategy::Manual => "manual",
            ResolutionStrategy::Custom(_) => "custom",
        }
    }

    fn critical(fields: &[&str]) -> Self {
        ResolutionStrategy::CriticalFieldMerge {
            critical_fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl fmt::Debug for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionStrategy::CriticalFieldMerge { critical_fields } => f
                .debug_struct("CriticalFieldMerge")
                .field("critical_fields", critical_fields)
                .finish(),
            ResolutionStrategy::QuantityMerge {
                quantity_fields,
                threshold,
            } => f
                .debug_struct("QuantityMerge")
                .field("quantity_fields", quantity_fields)
                .field("threshold", threshold)
                .finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// Conflict resolution registry
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    strategies: HashMap<String, ResolutionStrategy>,
    fallback: ResolutionStrategy,
}

impl ConflictResolver {
    /// Resolver with no registered types; everything resolves to manual
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
            fallback: ResolutionStrategy::Manual,
        }
    }

    /// Resolver with the default policy table
    pub fn with_defaults() -> Self {
        let mut resolver = Self::new();
        resolver.register("needs", ResolutionStrategy::LastWriteWins);
        resolver.register("tasks", ResolutionStrategy::critical(&["status", "assigned_to"]));
        resolver.register("volunteers", ResolutionStrategy::critical(&["status", "assigned_to"]));
        resolver.register(
            "inventory",
            ResolutionStrategy::QuantityMerge {
                quantity_fields: vec![
                    "quantity".to_string(),
                    "available".to_string(),
                    "reserved".to_string(),
                ],
                threshold: DEFAULT_QUANTITY_THRESHOLD,
            },
        );
        resolver.register("profiles", ResolutionStrategy::ServerAuthoritative);
        resolver.register("users", ResolutionStrategy::ServerAuthoritative);
        resolver
    }

    pub fn register(&mut self, entity_type: impl Into<String>, strategy: ResolutionStrategy) {
        self.strategies.insert(entity_type.into(), strategy);
    }

    /// Strategy applied to a type; unmatched types are manual
    pub fn strategy_for(&self, entity_type: &str) -> &ResolutionStrategy {
        self.strategies.get(entity_type).unwrap_or(&self.fallback)
    }

    pub fn resolve(&self, entity_id: &str, entity_type: &str, local: &Value, server: &Value) -> Resolution {
        let resolution = match self.strategy_for(entity_type) {
            ResolutionStrategy::LastWriteWins => last_write_wins(local, server),
            ResolutionStrategy::CriticalFieldMerge { critical_fields } => {
                critical_field_merge(critical_fields, local, server)
            }
            ResolutionStrategy::QuantityMerge {
                quantity_fields,
                threshold,
            } => quantity_merge(quantity_fields, *threshold, local, server),
            ResolutionStrategy::ServerAuthoritative => Resolution::Server,
            ResolutionStrategy::Manual => Resolution::Manual,
            ResolutionStrategy::Custom(resolve) => resolve(entity_id, local, server),
        };

        tracing::debug!(
            "[Conflict] {}:{} resolved as {}",
            entity_type,
            entity_id,
            resolution.kind()
        );
        resolution
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// First parseable mutation timestamp of a payload
///
/// Strings are read as RFC 3339, numbers as epoch milliseconds.
pub fn embedded_timestamp(payload: &Value) -> Option<DateTime<Utc>> {
    TIMESTAMP_FIELDS.iter().find_map(|field| match payload.get(field)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    })
}

fn local_is_newer(local: &Value, server: &Value) -> bool {
    matches!(
        (embedded_timestamp(local), embedded_timestamp(server)),
        (Some(l), Some(s)) if l > s
    )
}

fn last_write_wins(local: &Value, server: &Value) -> Resolution {
    if local_is_newer(local, server) {
        Resolution::Local
    } else {
        Resolution::Server
    }
}

fn critical_field_merge(critical_fields: &[String], local: &Value, server: &Value) -> Resolution {
    let (Value::Object(local_map), Value::Object(server_map)) = (local, server) else {
        return last_write_wins(local, server);
    };

    let critical_differs = critical_fields
        .iter()
        .any(|f| local_map.get(f) != server_map.get(f));
    if critical_differs {
        return last_write_wins(local, server);
    }

    let prefer_local = local_is_newer(local, server);
    let mut merged: Map<String, Value> = server_map.clone();
    for (key, local_value) in local_map {
        match server_map.get(key) {
            None => {
                merged.insert(key.clone(), local_value.clone());
            }
            Some(server_value) if server_value != local_value && prefer_local => {
                merged.insert(key.clone(), local_value.clone());
            }
            Some(_) => {}
        }
    }

    Resolution::Merge(Value::Object(merged))
}

fn quantity_merge(quantity_fields: &[String], threshold: f64, local: &Value, server: &Value) -> Resolution {
    let (Value::Object(local_map), Value::Object(server_map)) = (local, server) else {
        return last_write_wins(local, server);
    };

    let diverged = quantity_fields.iter().any(|f| {
        match (
            local_map.get(f).and_then(Value::as_f64),
            server_map.get(f).and_then(Value::as_f64),
        ) {
            (Some(l), Some(s)) => (l - s).abs() > threshold,
            _ => false,
        }
    });
    if diverged {
        return last_write_wins(local, server);
    }

    let mut merged: Map<String, Value> = server_map.clone();
    for (key, value) in local_map {
        merged.insert(key.clone(), value.clone());
    }
    for field in quantity_fields {
        if let (Some(l), Some(s)) = (local_map.get(field), server_map.get(field)) {
            if let Some(max) = max_number(l, s) {
                merged.insert(field.clone(), max);
            }
        }
    }

    Resolution::Merge(Value::Object(merged))
}

/// Larger of two numbers, keeping integers as integers
fn max_number(a: &Value, b: &Value) -> Option<Value> {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return Some(Value::from(a.max(b)));
    }
    let (a, b) = (a.as_f64()?, b.as_f64()?);
    Some(Value::from(a.max(b)))
}
