//! Transaction statistics.
//!
//! One [`TxStats`] is shared by a manager and every manager derived from it
//! with the `with_*` builders.
//!
//! ```rust,ignore
//! let manager = TxManager::new(repository);
//! manager.tx(|| { /* ... */ Ok(()) })?;
//!
//! let stats = manager.stats().snapshot();
//! println!("commits: {}, retries: {}", stats.commits, stats.retries);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for transactions run by a manager.
///
/// All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
pub struct TxStats {
    /// Physical transactions started.
    attempts: AtomicU64,
    /// Successful commits.
    commits: AtomicU64,
    /// Rollbacks after a failed attempt.
    rollbacks: AtomicU64,
    /// Attempts finished by a dry-run rollback.
    dry_runs: AtomicU64,
    /// Attempts repeated after a retryable failure.
    retries: AtomicU64,
    /// Logical transactions that ended with an error.
    failures: AtomicU64,
}

impl TxStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dry_run(&self) {
        self.dry_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of physical transactions started.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Returns the number of successful commits.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Returns the number of rollbacks.
    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    /// Returns the number of dry-run attempts.
    pub fn dry_runs(&self) -> u64 {
        self.dry_runs.load(Ordering::Relaxed)
    }

    /// Returns the number of retries.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Returns the number of failed logical transactions.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> TxStatsSnapshot {
        TxStatsSnapshot {
            attempts: self.attempts(),
            commits: self.commits(),
            rollbacks: self.rollbacks(),
            dry_runs: self.dry_runs(),
            retries: self.retries(),
            failures: self.failures(),
        }
    }
}

/// A point-in-time copy of [`TxStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxStatsSnapshot {
    /// Physical transactions started.
    pub attempts: u64,
    /// Successful commits.
    pub commits: u64,
    /// Rollbacks after a failed attempt.
    pub rollbacks: u64,
    /// Dry-run attempts.
    pub dry_runs: u64,
    /// Retries.
    pub retries: u64,
    /// Failed logical transactions.
    pub failures: u64,
}
