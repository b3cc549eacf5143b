//! In-memory repository.

use crate::store::Store;
use crate::transaction::InMemoryTransaction;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tabletx_core::{
    decode, encode, Entity, Repository, RepositoryTransaction, TxError, TxOptions, TxResult,
};

#[derive(Default)]
pub(crate) struct Shared {
    pub(crate) store: Store,
    pub(crate) start_failures: Mutex<VecDeque<TxError>>,
    pub(crate) commit_failures: Mutex<VecDeque<TxError>>,
    pub(crate) started: AtomicU64,
    pub(crate) committed: AtomicU64,
    pub(crate) rolled_back: AtomicU64,
    pub(crate) conflicts: AtomicU64,
}

/// A repository that keeps every table in memory.
///
/// Transactions are optimistic: reads record the version they observed,
/// writes are buffered, and commit fails with a retryable
/// [`RetryReason::OptimisticLock`](tabletx_core::RetryReason) error if any
/// row read has changed since. Read-only transactions never conflict.
///
/// Cloning yields another handle to the same data.
///
/// # Example
///
/// ```rust
/// use tabletx_core::{Repository, TxOptions};
/// use tabletx_inmemory::InMemoryRepository;
///
/// let repo = InMemoryRepository::new();
/// let mut txn = repo.start_transaction(&TxOptions::default()).unwrap();
/// txn.upsert("notes", vec![1], vec![42]).unwrap();
/// txn.commit().unwrap();
/// assert_eq!(repo.get("notes", &[1]), Some(vec![42]));
/// ```
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    shared: Arc<Shared>,
}

impl InMemoryRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `start_transaction` call fail with `error`.
    pub fn inject_start_failure(&self, error: TxError) {
        self.shared.start_failures.lock().push_back(error);
    }

    /// Makes the next `commit` call fail with `error`. The transaction
    /// does not apply its writes.
    pub fn inject_commit_failure(&self, error: TxError) {
        self.shared.commit_failures.lock().push_back(error);
    }

    /// Returns a committed row.
    #[must_use]
    pub fn get(&self, table: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.shared.store.read(table, key).map(|(value, _)| value)
    }

    /// Writes a row outside any transaction.
    pub fn put(&self, table: &str, key: Vec<u8>, value: Vec<u8>) {
        self.shared.store.put(table, key, value);
    }

    /// Returns a committed entity.
    pub fn get_entity<E: Entity>(&self, id: &E::Id) -> TxResult<Option<E>> {
        self.get(E::TABLE, &encode(id)?)
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Writes an entity outside any transaction.
    pub fn put_entity<E: Entity>(&self, entity: &E) -> TxResult<()> {
        self.put(E::TABLE, encode(&entity.id())?, encode(entity)?);
        Ok(())
    }

    /// Returns the number of committed rows in `table`.
    #[must_use]
    pub fn len(&self, table: &str) -> usize {
        self.shared.store.len(table)
    }

    /// Returns true if `table` has no rows.
    #[must_use]
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Returns the sequence of the last commit.
    #[must_use]
    pub fn committed_seq(&self) -> u64 {
        self.shared.store.committed_seq()
    }

    /// Number of transactions started.
    #[must_use]
    pub fn started(&self) -> u64 {
        self.shared.started.load(Ordering::SeqCst)
    }

    /// Number of successful commits.
    #[must_use]
    pub fn committed(&self) -> u64 {
        self.shared.committed.load(Ordering::SeqCst)
    }

    /// Number of rollbacks.
    #[must_use]
    pub fn rolled_back(&self) -> u64 {
        self.shared.rolled_back.load(Ordering::SeqCst)
    }

    /// Number of commits rejected by conflict detection.
    #[must_use]
    pub fn conflicts(&self) -> u64 {
        self.shared.conflicts.load(Ordering::SeqCst)
    }
}

impl Repository for InMemoryRepository {
    fn start_transaction(&self, options: &TxOptions) -> TxResult<Box<dyn RepositoryTransaction>> {
        if let Some(err) = self.shared.start_failures.lock().pop_front() {
            return Err(err);
        }
        self.shared.started.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryTransaction::new(
            Arc::clone(&self.shared),
            options.clone(),
        )))
    }
}

impl fmt::Debug for InMemoryRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryRepository")
            .field("committed_seq", &self.committed_seq())
            .field("started", &self.started())
            .field("committed", &self.committed())
            .field("rolled_back", &self.rolled_back())
            .field("conflicts", &self.conflicts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tabletx_core::{handoff_queue, IsolationLevel, RetryReason};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: u32,
        qty: i32,
    }

    impl Entity for Item {
        type Id = u32;
        const TABLE: &'static str = "items";

        fn id(&self) -> u32 {
            self.id
        }
    }

    fn read_write() -> TxOptions {
        TxOptions::default()
    }

    #[test]
    fn commit_makes_writes_visible() {
        let repo = InMemoryRepository::new();
        let mut txn = repo.start_transaction(&read_write()).unwrap();
        txn.upsert("t", vec![1], vec![1]).unwrap();
        assert_eq!(txn.find("t", &[1]).unwrap(), Some(vec![1]));
        assert_eq!(repo.get("t", &[1]), None);

        txn.commit().unwrap();
        assert_eq!(repo.get("t", &[1]), Some(vec![1]));
        assert_eq!(repo.committed(), 1);
        assert!(txn.find("t", &[1]).is_err());
    }

    #[test]
    fn concurrent_update_conflicts() {
        let repo = InMemoryRepository::new();
        repo.put("t", vec![1], vec![0]);

        let mut first = repo.start_transaction(&read_write()).unwrap();
        let mut second = repo.start_transaction(&read_write()).unwrap();
        first.find("t", &[1]).unwrap();
        second.find("t", &[1]).unwrap();
        first.upsert("t", vec![1], vec![1]).unwrap();
        second.upsert("t", vec![1], vec![2]).unwrap();

        first.commit().unwrap();
        let err = second.commit().unwrap_err();
        assert_eq!(err.retryable_cause().unwrap().reason, RetryReason::OptimisticLock);
        assert_eq!(repo.get("t", &[1]), Some(vec![1]));
        assert_eq!(repo.conflicts(), 1);
    }

    #[test]
    fn blind_writes_do_not_conflict() {
        let repo = InMemoryRepository::new();
        let mut first = repo.start_transaction(&read_write()).unwrap();
        let mut second = repo.start_transaction(&read_write()).unwrap();
        first.upsert("t", vec![1], vec![1]).unwrap();
        second.upsert("t", vec![1], vec![2]).unwrap();
        first.commit().unwrap();
        second.commit().unwrap();
        assert_eq!(repo.get("t", &[1]), Some(vec![2]));
    }

    #[test]
    fn read_only_never_conflicts() {
        let repo = InMemoryRepository::new();
        repo.put("t", vec![1], vec![0]);
        let options = TxOptions::default().with_isolation_level(IsolationLevel::Snapshot);

        let mut reader = repo.start_transaction(&options).unwrap();
        reader.find("t", &[1]).unwrap();
        repo.put("t", vec![1], vec![9]);

        reader.commit().unwrap();
        assert!(repo
            .start_transaction(&options)
            .unwrap()
            .upsert("t", vec![2], vec![2])
            .is_err());
    }

    #[test]
    fn find_all_merges_buffered_writes() {
        let repo = InMemoryRepository::new();
        repo.put("t", vec![1], vec![1]);
        repo.put("t", vec![2], vec![2]);

        let mut txn = repo.start_transaction(&read_write()).unwrap();
        txn.delete("t", vec![1]).unwrap();
        txn.upsert("t", vec![3], vec![3]).unwrap();
        let keys: Vec<_> = txn
            .find_all("t")
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec![vec![2], vec![3]]);
    }

    #[test]
    fn injected_failures_fire_once() {
        let repo = InMemoryRepository::new();
        repo.inject_start_failure(TxError::retryable(RetryReason::Unavailable, "down"));
        assert!(repo.start_transaction(&read_write()).is_err());
        assert_eq!(repo.started(), 0);

        repo.inject_commit_failure(TxError::repository("disk full"));
        let mut txn = repo.start_transaction(&read_write()).unwrap();
        txn.upsert("t", vec![1], vec![1]).unwrap();
        assert!(txn.commit().is_err());
        assert_eq!(repo.get("t", &[1]), None);
        assert!(txn.rollback().is_err());
    }

    #[test]
    fn stream_all_feeds_queue() {
        let repo = InMemoryRepository::new();
        for i in 0..50u8 {
            repo.put("t", vec![i], vec![i]);
        }
        let mut txn = repo.start_transaction(&read_write()).unwrap();
        let (producer, mut consumer) = handoff_queue(4, Duration::from_secs(10));
        txn.stream_all("t", producer).unwrap();

        let mut keys = Vec::new();
        while let Some(row) = consumer.poll().unwrap() {
            keys.push(row.key[0]);
        }
        assert_eq!(keys, (0..50u8).collect::<Vec<_>>());
    }

    #[test]
    fn entity_helpers_round_trip() {
        let repo = InMemoryRepository::new();
        repo.put_entity(&Item { id: 3, qty: 7 }).unwrap();
        assert_eq!(
            repo.get_entity::<Item>(&3).unwrap(),
            Some(Item { id: 3, qty: 7 })
        );
        assert_eq!(repo.get_entity::<Item>(&4).unwrap(), None);
        assert_eq!(repo.len(Item::TABLE), 1);
        assert!(repo.is_empty("other"));
    }
}
