//! Per-transaction options.

use crate::types::IsolationLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Whether indeterminate failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionalRetryMode {
    /// Never retry indeterminate failures.
    Never,
    /// Retry only while the outcome is known: commit not yet attempted, or
    /// the transaction cannot write.
    #[default]
    UntilCommit,
    /// Always retry indeterminate failures.
    Always,
}

/// Verbosity of the per-transaction statement log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Record every statement.
    Debug,
    /// Record writes and lifecycle events only.
    #[default]
    Info,
    /// Record nothing.
    Off,
}

/// Limits applied to streaming scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Maximum number of rows a scan may yield.
    pub max_size: usize,
    /// Deadline for the whole stream, measured from its start.
    pub timeout: Duration,
    /// Buffer between the producer and the consumer. Zero means rendezvous.
    pub queue_capacity: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            timeout: Duration::from_secs(5 * 60),
            queue_capacity: 1_000,
        }
    }
}

/// Options for one physical transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxOptions {
    /// Isolation level requested from the store.
    pub isolation_level: IsolationLevel,
    /// Whether reads and writes go through the first-level cache.
    pub first_level_cache: bool,
    /// Send writes to the store as they happen instead of at commit.
    pub immediate_writes: bool,
    /// Roll back instead of committing.
    pub dry_run: bool,
    /// Set for scan transactions.
    pub scan: Option<ScanOptions>,
    /// Timeout passed to the store for each request.
    pub timeout: Option<Duration>,
    /// Retry mode for indeterminate failures.
    pub conditional_retry_mode: ConditionalRetryMode,
    /// Statement log verbosity.
    pub log_level: LogLevel,
    /// Emit the statement log after a successful commit too.
    pub log_statement_on_success: bool,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::SerializableReadWrite,
            first_level_cache: true,
            immediate_writes: false,
            dry_run: false,
            scan: None,
            timeout: None,
            conditional_retry_mode: ConditionalRetryMode::UntilCommit,
            log_level: LogLevel::Info,
            log_statement_on_success: false,
        }
    }
}

impl TxOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the isolation level.
    #[must_use]
    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Enables or disables the first-level cache.
    #[must_use]
    pub fn with_first_level_cache(mut self, enabled: bool) -> Self {
        self.first_level_cache = enabled;
        self
    }

    /// Chooses immediate or delayed writes.
    #[must_use]
    pub fn with_immediate_writes(mut self, immediate: bool) -> Self {
        self.immediate_writes = immediate;
        self
    }

    /// Enables or disables dry run.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Marks the transaction as a scan.
    #[must_use]
    pub fn with_scan(mut self, scan: ScanOptions) -> Self {
        self.scan = Some(scan);
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the retry mode for indeterminate failures.
    #[must_use]
    pub fn with_conditional_retry_mode(mut self, mode: ConditionalRetryMode) -> Self {
        self.conditional_retry_mode = mode;
        self
    }

    /// Sets the statement log verbosity.
    #[must_use]
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Emits the statement log after successful commits.
    #[must_use]
    pub fn with_log_statement_on_success(mut self, enabled: bool) -> Self {
        self.log_statement_on_success = enabled;
        self
    }

    /// Returns true if the transaction cannot write.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.isolation_level.is_read_only()
    }

    /// Returns true for scan transactions.
    #[must_use]
    pub fn is_scan(&self) -> bool {
        self.scan.is_some()
    }

    /// Returns true if an indeterminate failure may be retried.
    #[must_use]
    pub fn can_conditionally_retry(&self, commit_attempted: bool) -> bool {
        match self.conditional_retry_mode {
            ConditionalRetryMode::Never => false,
            ConditionalRetryMode::Always => true,
            ConditionalRetryMode::UntilCommit => {
                !commit_attempted || self.is_read_only() || self.is_scan()
            }
        }
    }
}
