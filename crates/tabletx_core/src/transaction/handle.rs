//! Transaction handle.

use super::log::TxLog;
use crate::cache::FirstLevelCache;
use crate::config::TxOptions;
use crate::entity::Entity;
use crate::error::{TxError, TxResult};
use crate::repository::{Repository, RepositoryTransaction};
use crate::stats::TxStats;
use crate::table::Table;
use crate::types::TransactionId;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// State of a physical transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Transaction is active and can perform operations.
    Active,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been rolled back, or its commit failed.
    RolledBack,
}

/// A write queued until commit.
#[derive(Debug, Clone)]
pub(crate) enum PendingWrite {
    Upsert {
        table: &'static str,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        table: &'static str,
        key: Vec<u8>,
    },
}

type BeforeCommitHook = Box<dyn FnOnce() -> TxResult<()>>;
type Hook = Box<dyn FnOnce()>;

struct TxInner {
    id: TransactionId,
    name: String,
    label: String,
    options: TxOptions,
    physical: RefCell<Box<dyn RepositoryTransaction>>,
    cache: FirstLevelCache,
    pending: RefCell<Vec<PendingWrite>>,
    log: TxLog,
    before_commit: RefCell<Vec<BeforeCommitHook>>,
    after_commit: RefCell<Vec<Hook>>,
    finally: RefCell<Vec<Hook>>,
    state: Cell<TxState>,
    commit_attempted: Cell<bool>,
    stats: Arc<TxStats>,
}

/// Handle to the physical transaction of the current attempt.
///
/// Cloning is cheap and yields a handle to the same transaction. Handles are
/// confined to the thread running the attempt and must not be kept after the
/// attempt ends; every attempt gets a fresh transaction and cache.
#[derive(Clone)]
pub struct Tx {
    inner: Rc<TxInner>,
}

impl Tx {
    pub(crate) fn begin(
        repository: &dyn Repository,
        name: &str,
        options: &TxOptions,
        stats: Arc<TxStats>,
    ) -> TxResult<Self> {
        let physical = repository.start_transaction(options)?;
        stats.record_attempt();

        let id = TransactionId::new(NEXT_TX_ID.fetch_add(1, Ordering::Relaxed));
        let suffix = options.isolation_level.tx_id_suffix();
        let label = if suffix.is_empty() {
            format!("{name} {id}")
        } else {
            format!("{name} {id}/{suffix}")
        };
        let cache = if options.first_level_cache && !options.is_scan() {
            FirstLevelCache::new()
        } else {
            FirstLevelCache::disabled()
        };
        tracing::debug!(tx = %label, "transaction started");

        Ok(Self {
            inner: Rc::new(TxInner {
                id,
                name: name.to_string(),
                options: options.clone(),
                physical: RefCell::new(physical),
                cache,
                pending: RefCell::new(Vec::new()),
                log: TxLog::new(options.log_level, label.clone()),
                label,
                before_commit: RefCell::new(Vec::new()),
                after_commit: RefCell::new(Vec::new()),
                finally: RefCell::new(Vec::new()),
                state: Cell::new(TxState::Active),
                commit_attempted: Cell::new(false),
                stats,
            }),
        })
    }

    /// Returns the transaction ID.
    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    /// Returns the transaction name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the options this transaction runs with.
    pub fn options(&self) -> &TxOptions {
        &self.inner.options
    }

    /// Returns true if writes are rejected.
    pub fn is_read_only(&self) -> bool {
        self.inner.options.is_read_only()
    }

    /// Returns the current state.
    pub fn state(&self) -> TxState {
        self.inner.state.get()
    }

    /// Returns the first-level cache of this transaction.
    pub fn cache(&self) -> &FirstLevelCache {
        &self.inner.cache
    }

    /// Returns the statement log.
    pub fn log(&self) -> &TxLog {
        &self.inner.log
    }

    /// Returns typed access to the table of `E`.
    pub fn table<E: Entity>(&self) -> Table<E> {
        Table::new(self.clone())
    }

    /// Runs `hook` after the work and before commit. Hooks may issue writes
    /// and register further hooks. A failing hook fails the attempt.
    pub fn defer_before_commit(&self, hook: impl FnOnce() -> TxResult<()> + 'static) {
        self.inner.before_commit.borrow_mut().push(Box::new(hook));
    }

    /// Runs `hook` after a successful commit. Not run in dry-run mode.
    pub fn defer(&self, hook: impl FnOnce() + 'static) {
        self.inner.after_commit.borrow_mut().push(Box::new(hook));
    }

    /// Runs `hook` once the logical transaction ends, whether it succeeded
    /// or failed. Only hooks registered by the last attempt run. Not run in
    /// dry-run mode.
    pub fn defer_finally(&self, hook: impl FnOnce() + 'static) {
        self.inner.finally.borrow_mut().push(Box::new(hook));
    }

    pub(crate) fn check_writable(&self) -> TxResult<()> {
        self.ensure_active()?;
        if self.is_read_only() {
            return Err(TxError::ReadOnly {
                name: self.inner.name.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn ensure_active(&self) -> TxResult<()> {
        match self.state() {
            TxState::Active => Ok(()),
            TxState::Committed => Err(TxError::invalid_operation(
                "transaction already committed",
            )),
            TxState::RolledBack => Err(TxError::invalid_operation(
                "transaction already rolled back",
            )),
        }
    }

    pub(crate) fn commit_attempted(&self) -> bool {
        self.inner.commit_attempted.get()
    }

    /// Runs `f` against the physical transaction.
    pub(crate) fn with_physical<R>(
        &self,
        f: impl FnOnce(&mut dyn RepositoryTransaction) -> TxResult<R>,
    ) -> TxResult<R> {
        self.ensure_active()?;
        let mut physical = self.inner.physical.borrow_mut();
        f(physical.as_mut())
    }

    /// Queues or sends a write, depending on the write mode.
    pub(crate) fn write(&self, write: PendingWrite) -> TxResult<()> {
        self.check_writable()?;
        if self.inner.options.immediate_writes {
            self.apply(write)
        } else {
            self.inner.pending.borrow_mut().push(write);
            Ok(())
        }
    }

    fn apply(&self, write: PendingWrite) -> TxResult<()> {
        self.with_physical(|p| match write {
            PendingWrite::Upsert { table, key, value } => p.upsert(table, key, value),
            PendingWrite::Delete { table, key } => p.delete(table, key),
        })
    }

    fn run_before_commit_hooks(&self) -> TxResult<()> {
        loop {
            let hooks = std::mem::take(&mut *self.inner.before_commit.borrow_mut());
            if hooks.is_empty() {
                return Ok(());
            }
            for hook in hooks {
                hook()?;
            }
        }
    }

    fn flush(&self) -> TxResult<()> {
        let pending = std::mem::take(&mut *self.inner.pending.borrow_mut());
        for write in pending {
            self.apply(write)?;
        }
        Ok(())
    }

    /// Finishes a successful attempt: before-commit hooks, pending writes,
    /// then commit (or rollback in dry-run mode) and after-commit hooks.
    pub(crate) fn complete(&self) -> TxResult<()> {
        self.run_before_commit_hooks()?;
        self.flush()?;

        if self.inner.options.dry_run {
            self.inner.state.set(TxState::RolledBack);
            self.inner.physical.borrow_mut().rollback()?;
            self.inner.stats.record_dry_run();
            self.inner.log.emit("dry run");
            return Ok(());
        }

        self.inner.commit_attempted.set(true);
        let committed = self.inner.physical.borrow_mut().commit();
        if let Err(e) = committed {
            self.inner.state.set(TxState::RolledBack);
            self.inner.log.emit("commit failed");
            return Err(e);
        }
        self.inner.state.set(TxState::Committed);
        self.inner.stats.record_commit();
        tracing::debug!(tx = %self, "transaction committed");
        if self.inner.options.log_statement_on_success {
            self.inner.log.emit("committed");
        }

        let hooks = std::mem::take(&mut *self.inner.after_commit.borrow_mut());
        for hook in hooks {
            hook();
        }
        Ok(())
    }

    /// Rolls back after a failed attempt. Failures are logged, not returned,
    /// so they never mask the error that caused the rollback.
    pub(crate) fn rollback_quietly(&self, cause: &TxError) {
        if self.state() != TxState::Active {
            return;
        }
        self.inner.state.set(TxState::RolledBack);
        self.inner.pending.borrow_mut().clear();
        self.inner.stats.record_rollback();
        if let Err(e) = self.inner.physical.borrow_mut().rollback() {
            tracing::warn!(tx = %self, error = %e, cause = %cause, "rollback failed");
        }
        self.inner.log.emit("rolled back");
    }

    pub(crate) fn take_finally_hooks(&self) -> Vec<Box<dyn FnOnce()>> {
        std::mem::take(&mut *self.inner.finally.borrow_mut())
    }
}

impl fmt::Display for Tx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.label)
    }
}

impl fmt::Debug for Tx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tx")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("isolation_level", &self.inner.options.isolation_level)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RetryReason;
    use crate::repository::MockRepository;
    use crate::types::IsolationLevel;

    fn begin(repo: &MockRepository, options: &TxOptions) -> Tx {
        Tx::begin(repo, "test", options, Arc::new(TxStats::new())).unwrap()
    }

    fn upsert(key: u8) -> PendingWrite {
        PendingWrite::Upsert {
            table: "t",
            key: vec![key],
            value: vec![key],
        }
    }

    #[test]
    fn new_transaction_is_active() {
        let repo = MockRepository::new();
        let tx = begin(&repo, &TxOptions::default());
        assert_eq!(tx.state(), TxState::Active);
        assert!(tx.cache().is_enabled());
        assert_eq!(repo.started(), 1);
    }

    #[test]
    fn delayed_writes_flush_on_commit() {
        let repo = MockRepository::new();
        let tx = begin(&repo, &TxOptions::default());
        tx.write(upsert(1)).unwrap();
        assert!(tx.with_physical(|p| p.find("t", &[1])).unwrap().is_none());

        tx.complete().unwrap();
        assert_eq!(tx.state(), TxState::Committed);
        assert_eq!(repo.row("t", &[1]), Some(vec![1]));
    }

    #[test]
    fn immediate_writes_reach_physical_transaction() {
        let repo = MockRepository::new();
        let tx = begin(&repo, &TxOptions::default().with_immediate_writes(true));
        tx.write(upsert(1)).unwrap();
        assert!(tx.with_physical(|p| p.find("t", &[1])).unwrap().is_some());
    }

    #[test]
    fn read_only_rejects_writes() {
        let repo = MockRepository::new();
        let options = TxOptions::default().with_isolation_level(IsolationLevel::Snapshot);
        let tx = begin(&repo, &options);
        let err = tx.write(upsert(1)).unwrap_err();
        assert!(matches!(err, TxError::ReadOnly { .. }));
    }

    #[test]
    fn hooks_run_in_order() {
        let repo = MockRepository::new();
        let tx = begin(&repo, &TxOptions::default());
        let events = Rc::new(RefCell::new(Vec::new()));

        let e = Rc::clone(&events);
        let inner_tx = tx.clone();
        tx.defer_before_commit(move || {
            e.borrow_mut().push("before");
            let e2 = Rc::clone(&e);
            inner_tx.defer_before_commit(move || {
                e2.borrow_mut().push("nested before");
                Ok(())
            });
            inner_tx.write(upsert(2))
        });
        let e = Rc::clone(&events);
        tx.defer(move || e.borrow_mut().push("after"));

        tx.complete().unwrap();
        assert_eq!(*events.borrow(), vec!["before", "nested before", "after"]);
        assert_eq!(repo.row("t", &[2]), Some(vec![2]));
    }

    #[test]
    fn dry_run_rolls_back() {
        let repo = MockRepository::new();
        let tx = begin(&repo, &TxOptions::default().with_dry_run(true));
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        tx.defer(move || flag.set(true));
        tx.write(upsert(1)).unwrap();

        tx.complete().unwrap();
        assert_eq!(tx.state(), TxState::RolledBack);
        assert!(!tx.commit_attempted());
        assert!(!ran.get());
        assert_eq!(repo.row("t", &[1]), None);
        assert_eq!(repo.rolled_back(), 1);
    }

    #[test]
    fn failed_commit_is_terminal_and_skips_rollback() {
        let repo = MockRepository::new();
        repo.fail_next_commit(TxError::retryable(RetryReason::OptimisticLock, "conflict"));
        let tx = begin(&repo, &TxOptions::default());

        let err = tx.complete().unwrap_err();
        assert!(tx.commit_attempted());
        assert_eq!(tx.state(), TxState::RolledBack);

        tx.rollback_quietly(&err);
        assert_eq!(repo.rolled_back(), 0);
    }

    #[test]
    fn rollback_failure_is_suppressed() {
        let repo = MockRepository::new();
        repo.fail_next_rollback(TxError::repository("connection reset"));
        let tx = begin(&repo, &TxOptions::default());

        tx.rollback_quietly(&TxError::application("work failed"));
        assert_eq!(tx.state(), TxState::RolledBack);
        assert!(tx.ensure_active().is_err());
    }

    #[test]
    fn display_includes_isolation_suffix() {
        let repo = MockRepository::new();
        let rw = begin(&repo, &TxOptions::default());
        assert!(!rw.to_string().contains('/'));

        let ro = begin(
            &repo,
            &TxOptions::default().with_isolation_level(IsolationLevel::OnlineConsistentReadOnly),
        );
        assert!(ro.to_string().ends_with("/OC"));
    }
}
