//! Backing store abstraction.
//!
//! The transaction manager talks to the store only through these traits,
//! so a real database client, the in-memory backend and test doubles are
//! interchangeable.

use crate::config::TxOptions;
use crate::error::{TxError, TxResult};
use crate::queue::QueueProducer;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An encoded row: CBOR key and CBOR value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Encoded entity id.
    pub key: Vec<u8>,
    /// Encoded entity.
    pub value: Vec<u8>,
}

/// Opens physical transactions.
pub trait Repository: Send + Sync {
    /// Starts a physical transaction with the given isolation and options.
    fn start_transaction(&self, options: &TxOptions) -> TxResult<Box<dyn RepositoryTransaction>>;
}

/// One physical transaction against the store.
///
/// After `commit` or `rollback` returns, successfully or not, the
/// transaction is terminal and every further call fails.
pub trait RepositoryTransaction: Send {
    /// Options the transaction was started with.
    fn options(&self) -> &TxOptions;

    /// Reads one row.
    fn find(&mut self, table: &str, key: &[u8]) -> TxResult<Option<Vec<u8>>>;

    /// Reads every row of a table, ordered by key.
    fn find_all(&mut self, table: &str) -> TxResult<Vec<Row>>;

    /// Inserts or replaces a row.
    fn upsert(&mut self, table: &str, key: Vec<u8>, value: Vec<u8>) -> TxResult<()>;

    /// Deletes a row. Deleting a missing row is not an error.
    fn delete(&mut self, table: &str, key: Vec<u8>) -> TxResult<()>;

    /// Streams every row of a table into `sink`.
    ///
    /// The implementation must eventually call `sink.supplier_done` or drop
    /// the sink, and should stop early once `sink.is_closed()`.
    fn stream_all(&mut self, table: &str, sink: QueueProducer<Row>) -> TxResult<()>;

    /// Commits the transaction.
    fn commit(&mut self) -> TxResult<()>;

    /// Rolls the transaction back.
    fn rollback(&mut self) -> TxResult<()>;
}

impl<R: Repository + ?Sized> Repository for Arc<R> {
    fn start_transaction(&self, options: &TxOptions) -> TxResult<Box<dyn RepositoryTransaction>> {
        (**self).start_transaction(options)
    }
}

type Tables = BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

#[derive(Default)]
struct MockState {
    rows: Mutex<Tables>,
    start_failures: Mutex<VecDeque<TxError>>,
    commit_failures: Mutex<VecDeque<TxError>>,
    rollback_failures: Mutex<VecDeque<TxError>>,
    started: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

/// A scripted repository for testing.
///
/// Writes are buffered per transaction and applied on commit without any
/// conflict detection. Failures queued with `fail_next_*` are returned by
/// the next matching call, one per call.
#[derive(Clone, Default)]
pub struct MockRepository {
    state: Arc<MockState>,
}

impl MockRepository {
    /// Creates an empty mock repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure for the next `start_transaction`.
    pub fn fail_next_start(&self, error: TxError) {
        self.state.start_failures.lock().push_back(error);
    }

    /// Queues a failure for the next `commit`.
    pub fn fail_next_commit(&self, error: TxError) {
        self.state.commit_failures.lock().push_back(error);
    }

    /// Queues a failure for the next `rollback`.
    pub fn fail_next_rollback(&self, error: TxError) {
        self.state.rollback_failures.lock().push_back(error);
    }

    /// Stores a row directly, outside any transaction.
    pub fn insert_row(&self, table: &str, key: Vec<u8>, value: Vec<u8>) {
        self.state
            .rows
            .lock()
            .entry(table.to_string())
            .or_default()
            .insert(key, value);
    }

    /// Returns a committed row.
    pub fn row(&self, table: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.state.rows.lock().get(table)?.get(key).cloned()
    }

    /// Number of transactions started.
    pub fn started(&self) -> u64 {
        self.state.started.load(Ordering::SeqCst)
    }

    /// Number of successful commits.
    pub fn committed(&self) -> u64 {
        self.state.committed.load(Ordering::SeqCst)
    }

    /// Number of rollback calls, successful or not.
    pub fn rolled_back(&self) -> u64 {
        self.state.rolled_back.load(Ordering::SeqCst)
    }
}

impl Repository for MockRepository {
    fn start_transaction(&self, options: &TxOptions) -> TxResult<Box<dyn RepositoryTransaction>> {
        if let Some(err) = self.state.start_failures.lock().pop_front() {
            return Err(err);
        }
        self.state.started.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTransaction {
            state: Arc::clone(&self.state),
            options: options.clone(),
            writes: Vec::new(),
            active: true,
        }))
    }
}

enum MockWrite {
    Upsert(String, Vec<u8>, Vec<u8>),
    Delete(String, Vec<u8>),
}

struct MockTransaction {
    state: Arc<MockState>,
    options: TxOptions,
    writes: Vec<MockWrite>,
    active: bool,
}

impl MockTransaction {
    fn ensure_active(&self) -> TxResult<()> {
        if self.active {
            Ok(())
        } else {
            Err(TxError::invalid_operation("transaction not active"))
        }
    }

    fn visible_rows(&self, table: &str) -> BTreeMap<Vec<u8>, Vec<u8>> {
        let mut rows = self
            .state
            .rows
            .lock()
            .get(table)
            .cloned()
            .unwrap_or_default();
        for write in &self.writes {
            match write {
                MockWrite::Upsert(t, k, v) if t == table => {
                    rows.insert(k.clone(), v.clone());
                }
                MockWrite::Delete(t, k) if t == table => {
                    rows.remove(k);
                }
                _ => {}
            }
        }
        rows
    }
}

impl RepositoryTransaction for MockTransaction {
    fn options(&self) -> &TxOptions {
        &self.options
    }

    fn find(&mut self, table: &str, key: &[u8]) -> TxResult<Option<Vec<u8>>> {
        self.ensure_active()?;
        Ok(self.visible_rows(table).remove(key))
    }

    fn find_all(&mut self, table: &str) -> TxResult<Vec<Row>> {
        self.ensure_active()?;
        Ok(self
            .visible_rows(table)
            .into_iter()
            .map(|(key, value)| Row { key, value })
            .collect())
    }

    fn upsert(&mut self, table: &str, key: Vec<u8>, value: Vec<u8>) -> TxResult<()> {
        self.ensure_active()?;
        self.writes
            .push(MockWrite::Upsert(table.to_string(), key, value));
        Ok(())
    }

    fn delete(&mut self, table: &str, key: Vec<u8>) -> TxResult<()> {
        self.ensure_active()?;
        self.writes.push(MockWrite::Delete(table.to_string(), key));
        Ok(())
    }

    fn stream_all(&mut self, table: &str, mut sink: QueueProducer<Row>) -> TxResult<()> {
        let rows = self.find_all(table)?;
        std::thread::spawn(move || {
            for row in rows {
                match sink.offer(row) {
                    Ok(true) => {}
                    Ok(false) | Err(_) => return,
                }
            }
            sink.supplier_done(|| Ok(()));
        });
        Ok(())
    }

    fn commit(&mut self) -> TxResult<()> {
        self.ensure_active()?;
        self.active = false;
        if let Some(err) = self.state.commit_failures.lock().pop_front() {
            return Err(err);
        }
        let mut rows = self.state.rows.lock();
        for write in self.writes.drain(..) {
            match write {
                MockWrite::Upsert(table, key, value) => {
                    rows.entry(table).or_default().insert(key, value);
                }
                MockWrite::Delete(table, key) => {
                    if let Some(t) = rows.get_mut(&table) {
                        t.remove(&key);
                    }
                }
            }
        }
        self.state.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> TxResult<()> {
        self.ensure_active()?;
        self.active = false;
        self.writes.clear();
        self.state.rolled_back.fetch_add(1, Ordering::SeqCst);
        match self.state.rollback_failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RetryReason;
    use crate::queue::handoff_queue;
    use std::time::Duration;

    #[test]
    fn commit_applies_writes() {
        let repo = MockRepository::new();
        let mut txn = repo.start_transaction(&TxOptions::default()).unwrap();
        txn.upsert("t", vec![1], vec![10]).unwrap();
        assert_eq!(txn.find("t", &[1]).unwrap(), Some(vec![10]));
        assert_eq!(repo.row("t", &[1]), None);

        txn.commit().unwrap();
        assert_eq!(repo.row("t", &[1]), Some(vec![10]));
        assert_eq!(repo.started(), 1);
        assert_eq!(repo.committed(), 1);
    }

    #[test]
    fn rollback_discards_writes() {
        let repo = MockRepository::new();
        repo.insert_row("t", vec![1], vec![1]);

        let mut txn = repo.start_transaction(&TxOptions::default()).unwrap();
        txn.delete("t", vec![1]).unwrap();
        assert_eq!(txn.find("t", &[1]).unwrap(), None);
        txn.rollback().unwrap();

        assert_eq!(repo.row("t", &[1]), Some(vec![1]));
        assert_eq!(repo.rolled_back(), 1);
    }

    #[test]
    fn scripted_failures_fire_once() {
        let repo = MockRepository::new();
        repo.fail_next_commit(TxError::retryable(RetryReason::OptimisticLock, "conflict"));

        let mut first = repo.start_transaction(&TxOptions::default()).unwrap();
        assert!(first.commit().unwrap_err().is_retryable());
        assert!(first.commit().is_err());

        let mut second = repo.start_transaction(&TxOptions::default()).unwrap();
        second.commit().unwrap();
        assert_eq!(repo.committed(), 1);
    }

    #[test]
    fn start_failure() {
        let repo = MockRepository::new();
        repo.fail_next_start(TxError::retryable(RetryReason::Unavailable, "down"));
        assert!(repo.start_transaction(&TxOptions::default()).is_err());
        assert!(repo.start_transaction(&TxOptions::default()).is_ok());
        assert_eq!(repo.started(), 1);
    }

    #[test]
    fn stream_all_feeds_queue() {
        let repo = MockRepository::new();
        for i in 0..5u8 {
            repo.insert_row("t", vec![i], vec![i * 2]);
        }

        let mut txn = repo.start_transaction(&TxOptions::default()).unwrap();
        let (producer, mut consumer) = handoff_queue(2, Duration::from_secs(10));
        txn.stream_all("t", producer).unwrap();

        let mut keys = Vec::new();
        while let Some(row) = consumer.poll().unwrap() {
            keys.push(row.key[0]);
        }
        assert_eq!(keys, vec![0, 1, 2, 3, 4]);
    }
}
