//! Versioned row storage.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// Commit sequence that last wrote a row.
pub(crate) type Version = u64;

/// A `(table, key)` pair.
pub(crate) type RowKey = (String, Vec<u8>);

#[derive(Debug, Clone)]
struct Versioned {
    value: Vec<u8>,
    version: Version,
}

/// Rows of every table, each stamped with the sequence of its last commit.
#[derive(Debug, Default)]
pub(crate) struct Store {
    tables: RwLock<HashMap<String, BTreeMap<Vec<u8>, Versioned>>>,
    committed_seq: AtomicU64,
}

/// A read that no longer matches the store.
#[derive(Debug)]
pub(crate) struct Conflict {
    pub(crate) table: String,
    pub(crate) expected: Option<Version>,
    pub(crate) found: Option<Version>,
}

impl Store {
    pub(crate) fn read(&self, table: &str, key: &[u8]) -> Option<(Vec<u8>, Version)> {
        self.tables
            .read()
            .get(table)
            .and_then(|rows| rows.get(key))
            .map(|row| (row.value.clone(), row.version))
    }

    /// Returns every row of `table` ordered by key.
    pub(crate) fn scan(&self, table: &str) -> Vec<(Vec<u8>, Vec<u8>, Version)> {
        self.tables
            .read()
            .get(table)
            .map(|rows| {
                rows.iter()
                    .map(|(k, row)| (k.clone(), row.value.clone(), row.version))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Writes a row outside any transaction.
    pub(crate) fn put(&self, table: &str, key: Vec<u8>, value: Vec<u8>) {
        let version = self.next_seq();
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(key, Versioned { value, version });
    }

    pub(crate) fn len(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, BTreeMap::len)
    }

    pub(crate) fn committed_seq(&self) -> u64 {
        self.committed_seq.load(Ordering::SeqCst)
    }

    fn next_seq(&self) -> Version {
        self.committed_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Validates `reads` and applies `writes` atomically.
    ///
    /// A `None` write deletes the row. Returns the commit sequence.
    pub(crate) fn commit(
        &self,
        reads: &HashMap<RowKey, Option<Version>>,
        writes: BTreeMap<RowKey, Option<Vec<u8>>>,
    ) -> Result<Version, Conflict> {
        let mut tables = self.tables.write();

        for ((table, key), expected) in reads {
            let found = tables
                .get(table)
                .and_then(|rows| rows.get(key))
                .map(|row| row.version);
            if found != *expected {
                return Err(Conflict {
                    table: table.clone(),
                    expected: *expected,
                    found,
                });
            }
        }

        if writes.is_empty() {
            return Ok(self.committed_seq());
        }
        let version = self.next_seq();
        for ((table, key), value) in writes {
            let rows = tables.entry(table).or_default();
            match value {
                Some(value) => {
                    rows.insert(key, Versioned { value, version });
                }
                None => {
                    rows.remove(&key);
                }
            }
        }
        Ok(version)
    }
}
