//! Partitions and the record types stored in them.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::shared::model::{CachedResponse, ConflictRecord, DeadLetter, LocalEntity, QueuedAction};

/// Named partition of the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    ApiCache,
    Outbox,
    Conflicts,
    LocalData,
    DeadLetters,
}

impl Partition {
    pub const ALL: [Partition; 5] = [
        Partition::ApiCache,
        Partition::Outbox,
        Partition::Conflicts,
        Partition::LocalData,
        Partition::DeadLetters,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::ApiCache => "api_cache",
            Partition::Outbox => "outbox",
            Partition::Conflicts => "conflicts",
            Partition::LocalData => "local_data",
            Partition::DeadLetters => "dead_letters",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == name)
    }
}

/// A record type bound to one partition
pub trait StoreRecord: Serialize + DeserializeOwned + Send + Sync + Unpin {
    /// Partition holding records of this type
    const PARTITION: Partition;

    /// Primary key within the partition
    fn record_key(&self) -> String;
}

impl StoreRecord for QueuedAction {
    const PARTITION: Partition = Partition::Outbox;

    fn record_key(&self) -> String {
        self.id.to_string()
    }
}

impl StoreRecord for CachedResponse {
    const PARTITION: Partition = Partition::ApiCache;

    fn record_key(&self) -> String {
        self.endpoint.clone()
    }
}

impl StoreRecord for LocalEntity {
    const PARTITION: Partition = Partition::LocalData;

    fn record_key(&self) -> String {
        self.key()
    }
}

impl StoreRecord for ConflictRecord {
    const PARTITION: Partition = Partition::Conflicts;

    fn record_key(&self) -> String {
        self.id.clone()
    }
}

impl StoreRecord for DeadLetter {
    const PARTITION: Partition = Partition::DeadLetters;

    fn record_key(&self) -> String {
        self.id.clone()
    }
}
