//! Transaction manager.

use super::current;
use super::handle::{Tx, TxState};
use crate::config::{ConditionalRetryMode, LogLevel, ScanOptions, TxOptions};
use crate::error::{ErrorKind, TxError, TxResult};
use crate::interrupt;
use crate::repository::Repository;
use crate::retry::RetryPolicy;
use crate::stats::TxStats;
use crate::types::{IsolationLevel, Propagation};
use std::fmt;
use std::panic::Location;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How a transaction gets its diagnostic name when none is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NameGenerator {
    /// `file_stem:line` of the call site.
    #[default]
    Short,
    /// `path:line:column` of the call site.
    Long,
    /// No generated name; `with_name` is required.
    None,
}

/// Which rule wins when a failure is both retryable and listed as
/// non-rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NoRollbackPrecedence {
    /// Roll back and retry.
    #[default]
    Retry,
    /// Commit and return the failure.
    Commit,
}

type ErrorPredicate = Arc<dyn Fn(&TxError) -> bool + Send + Sync>;

#[derive(Clone)]
struct NoRollback {
    matches: ErrorPredicate,
    precedence: NoRollbackPrecedence,
}

#[derive(Clone)]
struct ManagerConfig {
    name: Option<String>,
    log_context: Option<String>,
    max_retries: u32,
    retry_policy: RetryPolicy,
    propagation: Propagation,
    name_generator: NameGenerator,
    options: TxOptions,
    no_rollback: Option<NoRollback>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: None,
            log_context: None,
            max_retries: TxManager::DEFAULT_MAX_RETRIES,
            retry_policy: RetryPolicy::exp_backoff_default(),
            propagation: Propagation::Never,
            name_generator: NameGenerator::Short,
            options: TxOptions::default(),
            no_rollback: None,
        }
    }
}

/// Runs units of work as retried transactions.
///
/// A manager is an immutable configuration. Every `with_*` method returns a
/// new manager and leaves the receiver, and any transaction it is running,
/// untouched. Managers derived from one another share the repository and
/// the [`TxStats`].
///
/// ## Execution
///
/// [`tx`](Self::tx) first checks whether a transaction is already bound to
/// the calling thread and applies the [`Propagation`] mode. When a new
/// transaction is needed it loops:
///
/// 1. Start a physical transaction with a fresh first-level cache.
/// 2. Bind it to the thread and run the work.
/// 3. Run before-commit hooks, flush delayed writes, commit.
/// 4. Run after-commit hooks and return the result.
///
/// A failed attempt is unbound and rolled back (rollback errors are only
/// logged). Retryable failures sleep per the retry policy and try again
/// until `max_retries` retries are used up; everything else is returned
/// immediately.
///
/// ```rust,ignore
/// let manager = TxManager::new(repository).with_name("transfer");
/// manager.tx(|| {
///     let accounts = current::get()?.table::<Account>();
///     let mut from = accounts.find(&from_id)?.ok_or_else(not_found)?;
///     from.balance -= amount;
///     accounts.save(from)
/// })?;
/// ```
#[derive(Clone)]
pub struct TxManager {
    repository: Arc<dyn Repository>,
    config: ManagerConfig,
    stats: Arc<TxStats>,
}

impl TxManager {
    /// Retries allowed by default, for 100 attempts in total.
    pub const DEFAULT_MAX_RETRIES: u32 = 99;

    /// Creates a manager with default configuration.
    pub fn new(repository: impl Repository + 'static) -> Self {
        Self::from_arc(Arc::new(repository))
    }

    /// Creates a manager over a shared repository.
    pub fn from_arc(repository: Arc<dyn Repository>) -> Self {
        Self {
            repository,
            config: ManagerConfig::default(),
            stats: Arc::new(TxStats::new()),
        }
    }

    fn derive(&self, change: impl FnOnce(&mut ManagerConfig)) -> Self {
        let mut derived = self.clone();
        change(&mut derived.config);
        derived
    }

    /// Sets an explicit transaction name.
    #[must_use]
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.derive(|c| c.name = Some(name))
    }

    /// Adds context shown next to the name in diagnostics.
    #[must_use]
    pub fn with_log_context(&self, context: impl Into<String>) -> Self {
        let context = context.into();
        self.derive(|c| c.log_context = Some(context))
    }

    /// Sets how many times a retryable failure is retried.
    #[must_use]
    pub fn with_max_retries(&self, max_retries: u32) -> Self {
        self.derive(|c| c.max_retries = max_retries)
    }

    /// Sets the backoff used between attempts.
    #[must_use]
    pub fn with_retry_policy(&self, policy: RetryPolicy) -> Self {
        if self.config.retry_policy.is_same_as(&policy) {
            return self.clone();
        }
        self.derive(|c| c.retry_policy = policy)
    }

    /// Sets the propagation mode.
    #[must_use]
    pub fn with_propagation(&self, propagation: Propagation) -> Self {
        self.derive(|c| c.propagation = propagation)
    }

    /// Runs in a new, independent transaction even inside another one.
    #[must_use]
    pub fn separate(&self) -> Self {
        self.with_propagation(Propagation::RequiresNew)
    }

    /// Sets the isolation level.
    #[must_use]
    pub fn with_isolation_level(&self, level: IsolationLevel) -> Self {
        self.derive(|c| c.options.isolation_level = level)
    }

    /// Replaces all per-transaction options.
    #[must_use]
    pub fn with_options(&self, options: TxOptions) -> Self {
        self.derive(|c| c.options = options)
    }

    /// Disables the first-level cache.
    #[must_use]
    pub fn no_first_level_cache(&self) -> Self {
        self.derive(|c| c.options.first_level_cache = false)
    }

    /// Queues writes until commit. This is the default.
    #[must_use]
    pub fn delayed_writes(&self) -> Self {
        self.derive(|c| c.options.immediate_writes = false)
    }

    /// Sends writes to the store as they are issued.
    #[must_use]
    pub fn immediate_writes(&self) -> Self {
        self.derive(|c| c.options.immediate_writes = true)
    }

    /// Rolls back instead of committing.
    #[must_use]
    pub fn with_dry_run(&self, dry_run: bool) -> Self {
        self.derive(|c| c.options.dry_run = dry_run)
    }

    /// Sets the per-request timeout passed to the store.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.derive(|c| c.options.timeout = Some(timeout))
    }

    /// Sets the statement log verbosity.
    #[must_use]
    pub fn with_log_level(&self, level: LogLevel) -> Self {
        self.derive(|c| c.options.log_level = level)
    }

    /// Emits the statement log after successful commits too.
    #[must_use]
    pub fn with_log_statement_on_success(&self, enabled: bool) -> Self {
        self.derive(|c| c.options.log_statement_on_success = enabled)
    }

    /// Sets how unnamed transactions are named.
    #[must_use]
    pub fn with_name_generator(&self, generator: NameGenerator) -> Self {
        self.derive(|c| c.name_generator = generator)
    }

    /// Sets the retry mode for indeterminate failures.
    #[must_use]
    pub fn with_conditional_retry_mode(&self, mode: ConditionalRetryMode) -> Self {
        self.derive(|c| c.options.conditional_retry_mode = mode)
    }

    /// Commits even when the work fails with an error matching `matches`,
    /// then returns that error.
    #[must_use]
    pub fn with_no_rollback_for(
        &self,
        matches: impl Fn(&TxError) -> bool + Send + Sync + 'static,
    ) -> Self {
        let precedence = self
            .config
            .no_rollback
            .as_ref()
            .map(|n| n.precedence)
            .unwrap_or_default();
        self.derive(|c| {
            c.no_rollback = Some(NoRollback {
                matches: Arc::new(matches),
                precedence,
            })
        })
    }

    /// Decides between retry and commit for failures that are both
    /// retryable and non-rollback. Has no effect without
    /// [`with_no_rollback_for`](Self::with_no_rollback_for).
    #[must_use]
    pub fn with_no_rollback_precedence(&self, precedence: NoRollbackPrecedence) -> Self {
        self.derive(|c| {
            if let Some(n) = c.no_rollback.as_mut() {
                n.precedence = precedence;
            }
        })
    }

    /// Switches to read-only transactions.
    #[must_use]
    pub fn read_only(&self) -> ReadOnlyTxManager {
        ReadOnlyTxManager {
            inner: self.with_isolation_level(IsolationLevel::OnlineConsistentReadOnly),
        }
    }

    /// Switches to scan transactions with default scan options.
    #[must_use]
    pub fn scan(&self) -> ScanTxManager {
        let inner = self.derive(|c| {
            c.options.isolation_level = IsolationLevel::Snapshot;
            c.options.first_level_cache = false;
            c.options.scan = Some(ScanOptions::default());
        });
        ScanTxManager { inner }
    }

    /// Returns the per-transaction options.
    pub fn options(&self) -> &TxOptions {
        &self.config.options
    }

    /// Returns the explicit name, if any.
    pub fn name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    /// Returns the retry budget.
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Returns the retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry_policy
    }

    /// Returns the propagation mode.
    pub fn propagation(&self) -> Propagation {
        self.config.propagation
    }

    /// Returns the statistics shared by this manager family.
    pub fn stats(&self) -> &TxStats {
        &self.stats
    }

    /// Runs `work` in a transaction and returns its result.
    ///
    /// `work` may run several times, once per attempt.
    #[track_caller]
    pub fn tx<T, F>(&self, mut work: F) -> TxResult<T>
    where
        F: FnMut() -> TxResult<T>,
    {
        let caller = Location::caller();

        if let Ok(outer) = current::get() {
            match self.config.propagation {
                Propagation::Never => {
                    let name = self
                        .resolve_name(caller)
                        .unwrap_or_else(|_| outer.name().to_string());
                    return Err(TxError::TransactionAlreadyExists { name });
                }
                Propagation::Required => {
                    if outer.options().isolation_level != self.config.options.isolation_level {
                        tracing::warn!(
                            tx = %outer,
                            requested = ?self.config.options.isolation_level,
                            "joining transaction with a different isolation level"
                        );
                    }
                    return work();
                }
                Propagation::RequiresNew => {}
            }
        }

        let name = self.resolve_name(caller)?;
        self.run_new(&name, work)
    }

    /// Runs `work` in a transaction.
    #[track_caller]
    pub fn run<F>(&self, work: F) -> TxResult<()>
    where
        F: FnMut() -> TxResult<()>,
    {
        self.tx(work)
    }

    fn resolve_name(&self, caller: &'static Location<'static>) -> TxResult<String> {
        if let Some(name) = &self.config.name {
            return Ok(name.clone());
        }
        match self.config.name_generator {
            NameGenerator::Short => {
                let stem = Path::new(caller.file())
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or(caller.file());
                Ok(format!("{stem}:{}", caller.line()))
            }
            NameGenerator::Long => Ok(format!(
                "{}:{}:{}",
                caller.file(),
                caller.line(),
                caller.column()
            )),
            NameGenerator::None => Err(TxError::invalid_operation(
                "transaction name is required when the name generator is None",
            )),
        }
    }

    fn run_new<T, F>(&self, name: &str, mut work: F) -> TxResult<T>
    where
        F: FnMut() -> TxResult<T>,
    {
        let label = match &self.config.log_context {
            Some(context) => format!("{name}[{context}]"),
            None => name.to_string(),
        };
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut finally_hooks = Vec::new();
        let mut attempt: u32 = 0;

        let result = loop {
            attempt += 1;
            let (outcome, tx) = match Tx::begin(
                self.repository.as_ref(),
                &label,
                &self.config.options,
                Arc::clone(&self.stats),
            ) {
                Ok(tx) => (self.attempt(&tx, &mut work), Some(tx)),
                Err(e) => (Err(e), None),
            };
            // A failed start keeps the hooks of the previous attempt.
            if let Some(tx) = &tx {
                finally_hooks = tx.take_finally_hooks();
            }

            let err = match outcome {
                Ok(value) => break Ok(value),
                Err(err) => err,
            };
            if tx.as_ref().is_some_and(|t| t.state() == TxState::Committed) {
                // Committed despite the error; repeating the work would apply it twice.
                break Err(err);
            }
            let commit_attempted = tx.as_ref().is_some_and(Tx::commit_attempted);
            drop(tx);

            match self.backoff(err, attempt, max_attempts, commit_attempted) {
                Ok(delay) => {
                    self.stats.record_retry();
                    tracing::debug!(
                        tx = %label,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "retrying transaction"
                    );
                    if let Err(e) = interrupt::sleep(delay) {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = &result {
            self.stats.record_failure();
            if e.kind() == ErrorKind::Interrupted {
                interrupt::restore();
            }
        }
        if !self.config.options.dry_run {
            for hook in finally_hooks {
                hook();
            }
        }
        result
    }

    fn attempt<T, F>(&self, tx: &Tx, work: &mut F) -> TxResult<T>
    where
        F: FnMut() -> TxResult<T>,
    {
        let outcome = {
            let _bound = current::bind(tx.clone());
            match work() {
                Ok(value) => tx.complete().map(|()| value),
                Err(err) if self.commits_despite(&err) => {
                    tracing::debug!(tx = %tx, error = %err, "committing despite error");
                    match tx.complete() {
                        Ok(()) => Err(err),
                        Err(commit_err) => Err(commit_err),
                    }
                }
                Err(err) => Err(err),
            }
        };
        if let Err(err) = &outcome {
            tx.rollback_quietly(err);
        }
        outcome
    }

    fn commits_despite(&self, err: &TxError) -> bool {
        let Some(no_rollback) = &self.config.no_rollback else {
            return false;
        };
        if !(no_rollback.matches)(err) {
            return false;
        }
        match err.kind() {
            ErrorKind::Retryable | ErrorKind::ConditionallyRetryable => {
                no_rollback.precedence == NoRollbackPrecedence::Commit
            }
            ErrorKind::Interrupted => false,
            ErrorKind::Fatal | ErrorKind::DeadlineExceeded | ErrorKind::ProgrammingError => true,
        }
    }

    /// Returns the wait before the next attempt, or the error to give up with.
    fn backoff(
        &self,
        err: TxError,
        attempt: u32,
        max_attempts: u32,
        commit_attempted: bool,
    ) -> Result<Duration, TxError> {
        match err.kind() {
            ErrorKind::Retryable => {}
            ErrorKind::ConditionallyRetryable => {
                if !self.config.options.can_conditionally_retry(commit_attempted) {
                    return Err(TxError::ConditionalRetryNotAttempted {
                        source: Box::new(err),
                    });
                }
            }
            _ => return Err(err),
        }

        if attempt >= max_attempts {
            tracing::warn!(attempts = attempt, error = %err, "transaction retries exhausted");
            return Err(TxError::RetriesExhausted {
                attempts: attempt,
                source: Box::new(err),
            });
        }

        let policy = err
            .retryable_cause()
            .and_then(|cause| cause.retry_policy)
            .unwrap_or(self.config.retry_policy);
        Ok(policy.calc_duration(attempt))
    }
}

impl fmt::Debug for TxManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxManager")
            .field("name", &self.config.name)
            .field("max_retries", &self.config.max_retries)
            .field("retry_policy", &self.config.retry_policy)
            .field("propagation", &self.config.propagation)
            .field("options", &self.config.options)
            .finish_non_exhaustive()
    }
}

/// Builder for read-only transactions. Created by [`TxManager::read_only`].
#[derive(Debug, Clone)]
pub struct ReadOnlyTxManager {
    inner: TxManager,
}

impl ReadOnlyTxManager {
    /// Sets a read-only isolation level. Rejects `SerializableReadWrite`.
    pub fn with_isolation_level(&self, level: IsolationLevel) -> TxResult<Self> {
        if !level.is_read_only() {
            return Err(TxError::invalid_argument(format!(
                "{level:?} is not a read-only isolation level"
            )));
        }
        Ok(Self {
            inner: self.inner.with_isolation_level(level),
        })
    }

    /// Disables the first-level cache.
    #[must_use]
    pub fn no_first_level_cache(&self) -> Self {
        Self {
            inner: self.inner.no_first_level_cache(),
        }
    }

    /// Sets an explicit transaction name.
    #[must_use]
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            inner: self.inner.with_name(name),
        }
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            inner: self.inner.with_timeout(timeout),
        }
    }

    /// Returns the underlying manager configuration.
    pub fn manager(&self) -> &TxManager {
        &self.inner
    }

    /// Runs `work` in a read-only transaction.
    #[track_caller]
    pub fn tx<T, F>(&self, work: F) -> TxResult<T>
    where
        F: FnMut() -> TxResult<T>,
    {
        self.inner.tx(work)
    }
}

/// Builder for scan transactions. Created by [`TxManager::scan`].
///
/// Scans are read-only, bypass the first-level cache and bound streamed
/// results by size and time.
#[derive(Debug, Clone)]
pub struct ScanTxManager {
    inner: TxManager,
}

impl ScanTxManager {
    fn with_scan(&self, change: impl FnOnce(&mut ScanOptions)) -> Self {
        let inner = self.inner.derive(|c| {
            let mut scan = c.options.scan.unwrap_or_default();
            change(&mut scan);
            c.options.scan = Some(scan);
        });
        Self { inner }
    }

    /// Sets the maximum number of streamed rows.
    #[must_use]
    pub fn with_max_size(&self, max_size: usize) -> Self {
        self.with_scan(|s| s.max_size = max_size)
    }

    /// Sets the deadline of each stream.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_scan(|s| s.timeout = timeout)
    }

    /// Sets the handoff queue capacity.
    #[must_use]
    pub fn with_queue_capacity(&self, capacity: usize) -> Self {
        self.with_scan(|s| s.queue_capacity = capacity)
    }

    /// Sets an explicit transaction name.
    #[must_use]
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            inner: self.inner.with_name(name),
        }
    }

    /// Returns the underlying manager configuration.
    pub fn manager(&self) -> &TxManager {
        &self.inner
    }

    /// Runs `work` in a scan transaction.
    #[track_caller]
    pub fn tx<T, F>(&self, work: F) -> TxResult<T>
    where
        F: FnMut() -> TxResult<T>,
    {
        self.inner.tx(work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::error::RetryReason;
    use crate::repository::MockRepository;
    use serde::{Deserialize, Serialize};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::sync::mpsc;
    use std::thread;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        id: u8,
        value: i64,
    }

    impl Entity for Counter {
        type Id = u8;
        const TABLE: &'static str = "counters";

        fn id(&self) -> u8 {
            self.id
        }
    }

    fn manager() -> (TxManager, MockRepository) {
        let repo = MockRepository::new();
        let manager = TxManager::new(repo.clone()).with_retry_policy(RetryPolicy::retry_immediately());
        (manager, repo)
    }

    fn conflict() -> TxError {
        TxError::retryable(RetryReason::OptimisticLock, "counters/1")
    }

    #[test]
    fn commits_and_returns_result() {
        let (manager, repo) = manager();
        let value = manager
            .tx(|| {
                current::get()?.table::<Counter>().save(Counter { id: 1, value: 7 })?;
                Ok(42)
            })
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(repo.committed(), 1);
        assert!(!current::exists());
        assert_eq!(manager.stats().commits(), 1);
    }

    #[test]
    fn never_rejects_nested_without_starting() {
        let (manager, repo) = manager();
        let nested = manager
            .tx(|| Ok(manager.with_name("inner").tx(|| Ok(()))))
            .unwrap();

        assert!(matches!(
            nested,
            Err(TxError::TransactionAlreadyExists { ref name }) if name == "inner"
        ));
        assert_eq!(repo.started(), 1);
    }

    #[test]
    fn required_joins_outer() {
        let (manager, repo) = manager();
        let joined = manager.with_propagation(Propagation::Required);

        manager
            .tx(|| {
                let outer = current::get()?.id();
                let inner = joined.tx(|| Ok(current::get()?.id()))?;
                assert_eq!(outer, inner);
                Ok(())
            })
            .unwrap();

        assert_eq!(repo.started(), 1);
        assert_eq!(repo.committed(), 1);
    }

    #[test]
    fn joining_needs_no_generated_name() {
        let (manager, repo) = manager();
        let joined = manager
            .with_propagation(Propagation::Required)
            .with_name_generator(NameGenerator::None);

        let names = manager
            .with_name("outer")
            .tx(|| {
                let outer = current::get()?.name().to_string();
                let inner = joined.tx(|| Ok(current::get()?.name().to_string()))?;
                Ok((outer, inner))
            })
            .unwrap();

        assert_eq!(names.0, "outer");
        assert_eq!(names.1, "outer");
        assert_eq!(repo.started(), 1);

        let nested = manager
            .with_name("outer")
            .tx(|| Ok(manager.with_name_generator(NameGenerator::None).tx(|| Ok(()))))
            .unwrap();
        assert!(matches!(
            nested,
            Err(TxError::TransactionAlreadyExists { ref name }) if name == "outer"
        ));
    }

    #[test]
    fn requires_new_shadows_and_restores() {
        let (manager, repo) = manager();

        manager
            .tx(|| {
                let outer = current::get()?.id();
                let inner = manager.separate().tx(|| Ok(current::get()?.id()))?;
                assert_ne!(outer, inner);
                assert_eq!(current::get()?.id(), outer);
                Ok(())
            })
            .unwrap();

        assert_eq!(repo.started(), 2);
        assert_eq!(repo.committed(), 2);
    }

    #[test]
    fn retries_exhausted_after_max_retries() {
        let (manager, repo) = manager();
        let calls = Cell::new(0);

        let err = manager
            .with_max_retries(3)
            .tx(|| -> TxResult<()> {
                calls.set(calls.get() + 1);
                Err(conflict())
            })
            .unwrap_err();

        assert_eq!(calls.get(), 4);
        assert_eq!(repo.committed(), 0);
        assert_eq!(repo.rolled_back(), 4);
        match &err {
            TxError::RetriesExhausted { attempts, .. } => assert_eq!(*attempts, 4),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            err.retryable_cause().unwrap().reason,
            RetryReason::OptimisticLock
        );
        assert_eq!(manager.stats().retries(), 3);
        assert_eq!(manager.stats().failures(), 1);
    }

    #[test]
    fn zero_retries_means_one_attempt() {
        let (manager, _repo) = manager();
        let calls = Cell::new(0);
        let err = manager
            .with_max_retries(0)
            .tx(|| -> TxResult<()> {
                calls.set(calls.get() + 1);
                Err(conflict())
            })
            .unwrap_err();
        assert_eq!(calls.get(), 1);
        assert!(matches!(err, TxError::RetriesExhausted { attempts: 1, .. }));
    }

    #[test]
    fn commit_conflict_is_retried() {
        let (manager, repo) = manager();
        repo.fail_next_commit(conflict());
        let calls = Cell::new(0);

        manager
            .tx(|| {
                calls.set(calls.get() + 1);
                Ok(())
            })
            .unwrap();

        assert_eq!(calls.get(), 2);
        assert_eq!(repo.committed(), 1);
        // A failed commit leaves nothing to roll back.
        assert_eq!(repo.rolled_back(), 0);
    }

    #[test]
    fn retryable_start_failure_is_retried() {
        let (manager, repo) = manager();
        repo.fail_next_start(TxError::retryable(RetryReason::Unavailable, "no session"));

        manager.tx(|| Ok(())).unwrap();
        assert_eq!(repo.started(), 1);
        assert_eq!(manager.stats().retries(), 1);
    }

    #[test]
    fn fatal_error_is_returned_unwrapped() {
        let (manager, repo) = manager();
        let calls = Cell::new(0);

        let err = manager
            .tx(|| -> TxResult<()> {
                calls.set(calls.get() + 1);
                Err(TxError::application("insufficient funds"))
            })
            .unwrap_err();

        assert_eq!(calls.get(), 1);
        assert_eq!(err.to_string(), "insufficient funds");
        assert_eq!(repo.rolled_back(), 1);
        assert_eq!(repo.committed(), 0);
    }

    #[test]
    fn rollback_failure_does_not_mask_error() {
        let (manager, repo) = manager();
        repo.fail_next_rollback(TxError::repository("connection reset"));

        let err = manager
            .tx(|| -> TxResult<()> { Err(TxError::application("bad input")) })
            .unwrap_err();
        assert_eq!(err.to_string(), "bad input");
    }

    #[test]
    fn no_rollback_commits_then_returns_error() {
        let (manager, repo) = manager();
        let manager = manager.with_no_rollback_for(|e| e.as_application().is_some());

        let err = manager
            .tx(|| -> TxResult<()> {
                current::get()?.table::<Counter>().save(Counter { id: 1, value: 1 })?;
                Err(TxError::application("audit warning"))
            })
            .unwrap_err();

        assert_eq!(err.to_string(), "audit warning");
        assert_eq!(repo.committed(), 1);
        assert_eq!(repo.rolled_back(), 0);
        assert!(repo.row("counters", &crate::entity::encode(&1u8).unwrap()).is_some());
    }

    #[test]
    fn retry_wins_over_no_rollback_by_default() {
        let (manager, repo) = manager();
        let manager = manager.with_max_retries(2).with_no_rollback_for(|_| true);

        let err = manager.tx(|| -> TxResult<()> { Err(conflict()) }).unwrap_err();
        assert!(matches!(err, TxError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(repo.committed(), 0);
    }

    #[test]
    fn commit_precedence_stops_retries() {
        let (manager, repo) = manager();
        let manager = manager
            .with_no_rollback_for(|_| true)
            .with_no_rollback_precedence(NoRollbackPrecedence::Commit);
        let calls = Cell::new(0);

        let err = manager
            .tx(|| -> TxResult<()> {
                calls.set(calls.get() + 1);
                Err(conflict())
            })
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(calls.get(), 1);
        assert_eq!(repo.committed(), 1);
    }

    #[test]
    fn indeterminate_commit_is_not_retried() {
        let (manager, repo) = manager();
        repo.fail_next_commit(TxError::conditionally_retryable(
            RetryReason::Timeout,
            "commit reply lost",
        ));

        let err = manager.tx(|| Ok(())).unwrap_err();
        assert!(matches!(err, TxError::ConditionalRetryNotAttempted { .. }));
        assert_eq!(err.retryable_cause().unwrap().reason, RetryReason::Timeout);
    }

    #[test]
    fn indeterminate_failure_before_commit_is_retried() {
        let (manager, _repo) = manager();
        let calls = Cell::new(0);

        manager
            .tx(|| {
                calls.set(calls.get() + 1);
                if calls.get() == 1 {
                    return Err(TxError::conditionally_retryable(RetryReason::Transport, "reset"));
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn read_only_rejects_writes_without_retry() {
        let (manager, repo) = manager();
        let calls = Cell::new(0);

        let err = manager
            .read_only()
            .tx(|| {
                calls.set(calls.get() + 1);
                current::get()?.table::<Counter>().save(Counter { id: 1, value: 1 })
            })
            .unwrap_err();

        assert!(matches!(err, TxError::ReadOnly { .. }));
        assert_eq!(calls.get(), 1);
        assert_eq!(repo.committed(), 0);
    }

    #[test]
    fn read_only_rejects_read_write_level() {
        let (manager, _repo) = manager();
        assert!(manager
            .read_only()
            .with_isolation_level(IsolationLevel::SerializableReadWrite)
            .is_err());
        let stale = manager
            .read_only()
            .with_isolation_level(IsolationLevel::StaleConsistentReadOnly)
            .unwrap();
        assert_eq!(
            stale.manager().options().isolation_level,
            IsolationLevel::StaleConsistentReadOnly
        );
    }

    #[test]
    fn scan_builder_sets_options() {
        let (manager, _repo) = manager();
        let scan = manager.scan().with_max_size(10).with_queue_capacity(0);
        let options = scan.manager().options();

        assert!(options.is_read_only());
        assert!(!options.first_level_cache);
        let scan_options = options.scan.unwrap();
        assert_eq!(scan_options.max_size, 10);
        assert_eq!(scan_options.queue_capacity, 0);
        assert_eq!(scan_options.timeout, Duration::from_secs(300));
    }

    #[test]
    fn builders_do_not_mutate_receiver() {
        let (manager, _repo) = manager();
        let named = manager.with_name("a").with_max_retries(5);
        assert_eq!(manager.name(), None);
        assert_eq!(manager.max_retries(), TxManager::DEFAULT_MAX_RETRIES);
        assert_eq!(named.name(), Some("a"));
        assert_eq!(named.max_retries(), 5);
        assert_eq!(manager.propagation(), Propagation::Never);
    }

    #[test]
    fn generated_names() {
        let (manager, _repo) = manager();

        let short = manager.tx(|| Ok(current::get()?.name().to_string())).unwrap();
        assert!(short.starts_with("manager:"), "{short}");

        let long = manager
            .with_name_generator(NameGenerator::Long)
            .tx(|| Ok(current::get()?.name().to_string()))
            .unwrap();
        assert!(long.contains("manager.rs:"), "{long}");
        assert_eq!(long.matches(':').count(), 2);

        let err = manager
            .with_name_generator(NameGenerator::None)
            .tx(|| Ok(()))
            .unwrap_err();
        assert!(matches!(err, TxError::InvalidOperation { .. }));

        let explicit = manager
            .with_name_generator(NameGenerator::None)
            .with_name("billing")
            .with_log_context("tenant-7")
            .tx(|| Ok(current::get()?.name().to_string()))
            .unwrap();
        assert_eq!(explicit, "billing[tenant-7]");
    }

    #[test]
    fn dry_run_never_commits() {
        let (manager, repo) = manager();
        manager
            .with_dry_run(true)
            .tx(|| current::get()?.table::<Counter>().save(Counter { id: 1, value: 1 }))
            .unwrap();

        assert_eq!(repo.committed(), 0);
        assert_eq!(repo.rolled_back(), 1);
        assert_eq!(manager.stats().dry_runs(), 1);
    }

    #[test]
    fn finally_hooks_of_last_attempt_run_once() {
        let (manager, repo) = manager();
        repo.fail_next_commit(conflict());
        let events = Rc::new(RefCell::new(Vec::new()));
        let attempt = Cell::new(0);

        manager
            .tx(|| {
                attempt.set(attempt.get() + 1);
                let n = attempt.get();
                let tx = current::get()?;
                let e = Rc::clone(&events);
                tx.defer_finally(move || e.borrow_mut().push(format!("finally {n}")));
                let e = Rc::clone(&events);
                tx.defer(move || e.borrow_mut().push(format!("committed {n}")));
                Ok(())
            })
            .unwrap();

        assert_eq!(
            *events.borrow(),
            vec!["committed 2".to_string(), "finally 2".to_string()]
        );
    }

    #[test]
    fn failed_start_keeps_previous_finally_hooks() {
        let (manager, repo) = manager();
        repo.fail_next_commit(conflict());
        let ran = Rc::new(Cell::new(0));

        let err = manager
            .tx(|| {
                let tx = current::get()?;
                let r = Rc::clone(&ran);
                tx.defer_finally(move || r.set(r.get() + 1));
                repo.fail_next_start(TxError::repository("bad credentials"));
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(err, TxError::Repository { .. }));
        assert_eq!(repo.started(), 1);
        assert_eq!(ran.get(), 1);
    }

    #[test]
    fn failing_before_commit_hook_fails_attempt() {
        let (manager, repo) = manager();
        let err = manager
            .tx(|| {
                current::get()?.defer_before_commit(|| Err(TxError::application("validation")));
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "validation");
        assert_eq!(repo.committed(), 0);
        assert_eq!(repo.rolled_back(), 1);
    }

    #[test]
    fn per_error_retry_policy_overrides_manager() {
        let repo = MockRepository::new();
        // Manager policy would wait a minute; the error asks for no wait.
        let manager = TxManager::new(repo.clone())
            .with_retry_policy(RetryPolicy::fixed(Duration::from_secs(60), 0.0).unwrap());
        let calls = Cell::new(0);

        manager
            .tx(|| {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    let cause = crate::error::RetryableError::new(RetryReason::SessionBusy, "busy")
                        .with_retry_policy(RetryPolicy::retry_immediately());
                    return Err(TxError::Retryable(cause));
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn interrupt_during_backoff_is_fatal() {
        let (tx, rx) = mpsc::channel();
        let worker = thread::spawn(move || {
            let repo = MockRepository::new();
            let manager = TxManager::new(repo.clone())
                .with_retry_policy(RetryPolicy::fixed(Duration::from_secs(60), 0.0).unwrap());
            tx.send(interrupt::current()).unwrap();
            let result = manager.tx(|| -> TxResult<()> { Err(conflict()) });
            (
                matches!(result, Err(TxError::Interrupted)),
                interrupt::is_interrupted(),
                repo.started(),
            )
        });

        let handle = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(100));
        handle.interrupt();

        let (interrupted, flagged, started) = worker.join().unwrap();
        assert!(interrupted);
        assert!(flagged);
        assert_eq!(started, 1);
    }

    #[test]
    fn interrupted_work_is_not_retried() {
        let (manager, repo) = manager();
        let err = manager
            .tx(|| -> TxResult<()> {
                interrupt::restore();
                interrupt::check()
            })
            .unwrap_err();

        assert!(matches!(err, TxError::Interrupted));
        assert!(interrupt::take());
        assert_eq!(repo.started(), 1);
        assert_eq!(repo.rolled_back(), 1);
    }
}
