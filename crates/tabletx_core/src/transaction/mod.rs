//! Transactions and the manager that runs them.
//!
//! [`TxManager`] owns the retry loop and propagation rules. Each attempt runs
//! against a fresh [`Tx`], which is bound to the calling thread and can be
//! reached from anywhere in the unit of work through [`current::get`].

pub mod current;
mod handle;
mod log;
mod manager;

pub(crate) use handle::PendingWrite;
pub use handle::{Tx, TxState};
pub use log::TxLog;
pub use manager::{
    NameGenerator, NoRollbackPrecedence, ReadOnlyTxManager, ScanTxManager, TxManager,
};
