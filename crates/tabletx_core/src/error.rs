//! Error types for tabletx.
//!
//! Every failure that crosses the transaction manager is a [`TxError`]. The
//! manager never looks at concrete variants when deciding what to do next; it
//! switches on [`TxError::kind`] instead.

use crate::retry::RetryPolicy;
use std::fmt;
use thiserror::Error;

/// Result type for transactional operations.
pub type TxResult<T> = Result<T, TxError>;

/// Coarse classification driving retry and propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transient failure; the attempt may be repeated.
    Retryable,
    /// Indeterminate failure; repeated only if the commit outcome is known.
    ConditionallyRetryable,
    /// Anything else, including application errors.
    Fatal,
    /// A stream or transaction deadline elapsed.
    DeadlineExceeded,
    /// The API was used incorrectly.
    ProgrammingError,
    /// The calling thread was interrupted.
    Interrupted,
}

/// Why the backing store asked for a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryReason {
    /// A row read by the transaction changed before commit.
    OptimisticLock,
    /// The store is temporarily unavailable.
    Unavailable,
    /// The store rejected the request because it is overloaded.
    Overloaded,
    /// The session is busy with another request.
    SessionBusy,
    /// The transport dropped the request.
    Transport,
    /// The request timed out on the client side.
    Timeout,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::OptimisticLock => "optimistic lock",
            Self::Unavailable => "unavailable",
            Self::Overloaded => "overloaded",
            Self::SessionBusy => "session busy",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
        };
        f.write_str(text)
    }
}

/// A transient failure signalled by the backing store.
#[derive(Debug, Clone, Error)]
#[error("{reason}: {message}")]
pub struct RetryableError {
    /// Failure category.
    pub reason: RetryReason,
    /// Human-readable detail.
    pub message: String,
    /// Backoff to use for this failure instead of the manager's policy.
    pub retry_policy: Option<RetryPolicy>,
}

impl RetryableError {
    /// Creates a retryable error that uses the manager's retry policy.
    pub fn new(reason: RetryReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            retry_policy: None,
        }
    }

    /// Overrides the backoff used after this failure.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// Errors produced while running transactions.
#[derive(Debug, Error)]
pub enum TxError {
    /// Transient failure that may succeed on another attempt.
    #[error("retryable failure: {0}")]
    Retryable(#[from] RetryableError),

    /// Failure whose effect on the store is unknown.
    #[error("indeterminate failure: {0}")]
    ConditionallyRetryable(RetryableError),

    /// The retry budget ran out. `source` is the last retryable failure.
    #[error("retries failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Last failure observed.
        #[source]
        source: Box<TxError>,
    },

    /// An indeterminate failure was not retried because the commit may have happened.
    #[error("conditional retries not attempted: {source}")]
    ConditionalRetryNotAttempted {
        /// The indeterminate failure.
        #[source]
        source: Box<TxError>,
    },

    /// A deadline elapsed.
    #[error("deadline exceeded: {message}")]
    DeadlineExceeded {
        /// What was waiting.
        message: String,
    },

    /// The calling thread was interrupted.
    #[error("interrupted")]
    Interrupted,

    /// A transaction with `Never` propagation was started inside another.
    #[error("transaction already exists (tried to start transaction '{name}')")]
    TransactionAlreadyExists {
        /// Name of the rejected transaction.
        name: String,
    },

    /// No transaction is bound to the current thread.
    #[error("operation is not allowed out of transaction context")]
    NoActiveTransaction,

    /// A write was issued inside a read-only transaction.
    #[error("write attempted in read-only transaction '{name}'")]
    ReadOnly {
        /// Name of the read-only transaction.
        name: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Invalid configuration value.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the bad value.
        message: String,
    },

    /// A streamed result grew past its configured limit.
    #[error("result truncated: more than {limit} rows")]
    ResultTruncated {
        /// Maximum number of rows allowed.
        limit: usize,
    },

    /// Entity encoding or decoding failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// Non-retryable backing store failure.
    #[error("repository error: {message}")]
    Repository {
        /// Description of the failure.
        message: String,
    },

    /// Error raised by the unit of work itself.
    #[error("{0}")]
    Application(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl TxError {
    /// Creates a retryable error.
    pub fn retryable(reason: RetryReason, message: impl Into<String>) -> Self {
        Self::Retryable(RetryableError::new(reason, message))
    }

    /// Creates a conditionally retryable error.
    pub fn conditionally_retryable(reason: RetryReason, message: impl Into<String>) -> Self {
        Self::ConditionallyRetryable(RetryableError::new(reason, message))
    }

    /// Creates a deadline exceeded error.
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a repository error.
    pub fn repository(message: impl Into<String>) -> Self {
        Self::Repository {
            message: message.into(),
        }
    }

    /// Wraps an application error.
    pub fn application(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Application(error.into())
    }

    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Retryable(_) => ErrorKind::Retryable,
            Self::ConditionallyRetryable(_) => ErrorKind::ConditionallyRetryable,
            Self::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::TransactionAlreadyExists { .. }
            | Self::NoActiveTransaction
            | Self::ReadOnly { .. }
            | Self::InvalidOperation { .. }
            | Self::InvalidArgument { .. } => ErrorKind::ProgrammingError,
            Self::RetriesExhausted { .. }
            | Self::ConditionalRetryNotAttempted { .. }
            | Self::ResultTruncated { .. }
            | Self::Codec { .. }
            | Self::Repository { .. }
            | Self::Application(_) => ErrorKind::Fatal,
        }
    }

    /// Returns true if the manager may repeat the attempt unconditionally.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    /// Returns the transient failure carried by this error, looking through
    /// `RetriesExhausted` and `ConditionalRetryNotAttempted`.
    pub fn retryable_cause(&self) -> Option<&RetryableError> {
        match self {
            Self::Retryable(e) | Self::ConditionallyRetryable(e) => Some(e),
            Self::RetriesExhausted { source, .. }
            | Self::ConditionalRetryNotAttempted { source } => source.retryable_cause(),
            _ => None,
        }
    }

    /// Returns the application error if this is one.
    pub fn as_application(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Application(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for TxError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        Self::codec(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for TxError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        Self::codec(e.to_string())
    }
}
