//! Optimistic physical transactions.

use crate::repository::Shared;
use crate::store::{RowKey, Version};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use tabletx_core::{
    QueueProducer, RepositoryTransaction, RetryReason, Row, TxError, TxOptions, TxResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Active,
    Committed,
    RolledBack,
}

/// A transaction that buffers writes and validates its reads on commit.
pub(crate) struct InMemoryTransaction {
    shared: Arc<Shared>,
    options: TxOptions,
    /// Versions observed by reads; `None` means the row was absent.
    reads: HashMap<RowKey, Option<Version>>,
    /// Buffered writes; `None` deletes the row.
    writes: BTreeMap<RowKey, Option<Vec<u8>>>,
    state: State,
}

impl InMemoryTransaction {
    pub(crate) fn new(shared: Arc<Shared>, options: TxOptions) -> Self {
        Self {
            shared,
            options,
            reads: HashMap::new(),
            writes: BTreeMap::new(),
            state: State::Active,
        }
    }

    fn ensure_active(&self) -> TxResult<()> {
        match self.state {
            State::Active => Ok(()),
            State::Committed => Err(TxError::invalid_operation("transaction already committed")),
            State::RolledBack => Err(TxError::invalid_operation(
                "transaction already rolled back",
            )),
        }
    }

    fn ensure_writable(&self) -> TxResult<()> {
        self.ensure_active()?;
        if self.options.is_read_only() {
            return Err(TxError::invalid_operation(
                "write issued in a read-only transaction",
            ));
        }
        Ok(())
    }

    fn record_read(&mut self, key: RowKey, observed: Option<Version>) {
        // Rows written by this transaction are not validated.
        if !self.options.is_read_only() && !self.writes.contains_key(&key) {
            self.reads.entry(key).or_insert(observed);
        }
    }
}

impl RepositoryTransaction for InMemoryTransaction {
    fn options(&self) -> &TxOptions {
        &self.options
    }

    fn find(&mut self, table: &str, key: &[u8]) -> TxResult<Option<Vec<u8>>> {
        self.ensure_active()?;
        let row_key = (table.to_string(), key.to_vec());
        if let Some(write) = self.writes.get(&row_key) {
            return Ok(write.clone());
        }
        let row = self.shared.store.read(table, key);
        self.record_read(row_key, row.as_ref().map(|(_, v)| *v));
        Ok(row.map(|(value, _)| value))
    }

    fn find_all(&mut self, table: &str) -> TxResult<Vec<Row>> {
        self.ensure_active()?;
        let mut rows = BTreeMap::new();
        for (key, value, version) in self.shared.store.scan(table) {
            self.record_read((table.to_string(), key.clone()), Some(version));
            rows.insert(key, value);
        }
        for ((t, key), write) in &self.writes {
            if t != table {
                continue;
            }
            match write {
                Some(value) => {
                    rows.insert(key.clone(), value.clone());
                }
                None => {
                    rows.remove(key);
                }
            }
        }
        Ok(rows
            .into_iter()
            .map(|(key, value)| Row { key, value })
            .collect())
    }

    fn upsert(&mut self, table: &str, key: Vec<u8>, value: Vec<u8>) -> TxResult<()> {
        self.ensure_writable()?;
        self.writes.insert((table.to_string(), key), Some(value));
        Ok(())
    }

    fn delete(&mut self, table: &str, key: Vec<u8>) -> TxResult<()> {
        self.ensure_writable()?;
        self.writes.insert((table.to_string(), key), None);
        Ok(())
    }

    fn stream_all(&mut self, table: &str, mut sink: QueueProducer<Row>) -> TxResult<()> {
        self.ensure_active()?;
        let rows = self.shared.store.scan(table);
        let table = table.to_string();
        thread::Builder::new()
            .name("tabletx-stream".into())
            .spawn(move || {
                for (key, value, _) in rows {
                    match sink.offer(Row { key, value }) {
                        Ok(true) => {}
                        Ok(false) => return,
                        Err(e) => {
                            tracing::debug!(table = %table, error = %e, "stream producer stopped");
                            return;
                        }
                    }
                }
                sink.supplier_done(|| Ok(()));
            })
            .map_err(|e| TxError::repository(format!("failed to spawn stream producer: {e}")))?;
        Ok(())
    }

    fn commit(&mut self) -> TxResult<()> {
        self.ensure_active()?;
        self.state = State::Committed;

        if let Some(err) = self.shared.commit_failures.lock().pop_front() {
            return Err(err);
        }

        let writes = std::mem::take(&mut self.writes);
        match self.shared.store.commit(&self.reads, writes) {
            Ok(seq) => {
                self.shared.committed.fetch_add(1, Ordering::SeqCst);
                tracing::trace!(seq, "in-memory commit");
                Ok(())
            }
            Err(conflict) => {
                self.shared.conflicts.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(
                    table = %conflict.table,
                    expected = ?conflict.expected,
                    found = ?conflict.found,
                    "optimistic lock conflict"
                );
                Err(TxError::retryable(
                    RetryReason::OptimisticLock,
                    format!("row in '{}' changed since it was read", conflict.table),
                ))
            }
        }
    }

    fn rollback(&mut self) -> TxResult<()> {
        self.ensure_active()?;
        self.state = State::RolledBack;
        self.reads.clear();
        self.writes.clear();
        self.shared.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
