use crate::core::Record;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Versions are globally unique so a dropped-and-recreated table never
/// hands out a version an older scope could mistake for its base.
static NEXT_RECORD_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_RECORD_VERSION.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub record: Record,
    pub version: u64,
}

/// A named table of keyed records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    name: String,
    rows: BTreeMap<String, VersionedRecord>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.rows.get(key).map(|row| &row.record)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.rows.contains_key(key)
    }

    pub fn version_of(&self, key: &str) -> Option<u64> {
        self.rows.get(key).map(|row| row.version)
    }

    /// All records in key order.
    pub fn scan(&self) -> Vec<Record> {
        self.rows.values().map(|row| row.record.clone()).collect()
    }

    /// Insert or replace, stamping a fresh version.
    pub fn upsert(&mut self, record: Record) {
        let key = record.key.clone();
        self.rows.insert(
            key,
            VersionedRecord {
                record,
                version: next_version(),
            },
        );
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.rows.remove(key).is_some()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}
