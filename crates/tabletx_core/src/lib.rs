//! # tabletx Core
//!
//! Client-side transaction execution for table databases.
//!
//! This crate provides:
//! - [`TxManager`], which runs a unit of work as a retried transaction with
//!   propagation rules, hooks, dry runs and a thread-bound ambient context
//! - [`FirstLevelCache`], a per-attempt identity map with read-your-writes
//! - A deadline-bounded single-producer/single-consumer handoff queue for
//!   streaming scans
//! - [`RetryPolicy`] backoff strategies
//!
//! The backing store is reached through the [`Repository`] trait. A scripted
//! [`MockRepository`] is included for tests.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tabletx_core::{current, TxManager};
//!
//! let manager = TxManager::new(repository).with_name("rename");
//! manager.tx(|| {
//!     let users = current::get()?.table::<User>();
//!     let mut user = users.find(&id)?.ok_or_else(missing)?;
//!     user.name = new_name.clone();
//!     users.save(user)
//! })?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod config;
mod entity;
mod error;
pub mod interrupt;
pub mod queue;
mod repository;
mod retry;
mod stats;
mod table;
mod transaction;
mod transactional;
mod types;

pub use cache::FirstLevelCache;
pub use config::{ConditionalRetryMode, LogLevel, ScanOptions, TxOptions};
pub use entity::{decode, encode, Entity};
pub use error::{ErrorKind, RetryReason, RetryableError, TxError, TxResult};
pub use interrupt::InterruptHandle;
pub use queue::{handoff_queue, handoff_queue_with_deadline, QueueConsumer, QueueProducer};
pub use repository::{MockRepository, Repository, RepositoryTransaction, Row};
pub use retry::{ExponentialBackoff, FixedDelay, RetryPolicy};
pub use stats::{TxStats, TxStatsSnapshot};
pub use table::{EntityStream, Table};
pub use transaction::{
    current, NameGenerator, NoRollbackPrecedence, ReadOnlyTxManager, ScanTxManager, Tx, TxLog,
    TxManager, TxState,
};
pub use transactional::{with_transaction, Transactional};
pub use types::{IsolationLevel, Propagation, TransactionId};
