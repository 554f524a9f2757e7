//! Latest known player positions fed by the change feed.

use std::collections::BTreeMap;
use std::sync::RwLock;

use land_proto::{PlayerRecord, Position};

use crate::runtime_util::{read_lock, write_lock};

/// Owned point-in-time copy of the cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionSnapshot {
    records: BTreeMap<String, PlayerRecord>,
}

impl PositionSnapshot {
    pub fn from_records(records: impl IntoIterator<Item = PlayerRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|record| (record.id().to_string(), record))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&PlayerRecord> {
        self.records.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &PlayerRecord> {
        self.records.values()
    }

    pub fn positions(&self) -> BTreeMap<String, Position> {
        self.records
            .iter()
            .map(|(id, record)| (id.clone(), record.position.clone()))
            .collect()
    }

    pub fn fresh(&self, now_ms: i64, stale_window_ms: i64) -> impl Iterator<Item = &PlayerRecord> {
        self.records
            .values()
            .filter(move |record| !record.is_stale(now_ms, stale_window_ms))
    }
}

/// Written only by the player change-feed consumer; read by any number of
/// tick-driven readers through [`PositionCache::snapshot`].
#[derive(Debug, Default)]
pub struct PositionCache {
    records: RwLock<BTreeMap<String, PlayerRecord>>,
}

impl PositionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, id: impl Into<String>, mut position: Position, source_updated_at_ms: i64) {
        let id = id.into();
        position.id = id.clone();
        write_lock(&self.records).insert(id, PlayerRecord::new(position, source_updated_at_ms));
    }

    /// Replaces every record of one change batch under a single write lock.
    pub fn apply_batch(&self, records: Vec<PlayerRecord>) {
        if records.is_empty() {
            return;
        }
        let mut current = write_lock(&self.records);
        for record in records {
            current.insert(record.id().to_string(), record);
        }
    }

    pub fn get(&self, id: &str) -> Option<Position> {
        read_lock(&self.records)
            .get(id)
            .map(|record| record.position.clone())
    }

    pub fn get_record(&self, id: &str) -> Option<PlayerRecord> {
        read_lock(&self.records).get(id).cloned()
    }

    pub fn snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            records: read_lock(&self.records).clone(),
        }
    }

    pub fn len(&self) -> usize {
        read_lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        read_lock(&self.records).is_empty()
    }
}
