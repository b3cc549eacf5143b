//! The transaction bound to the current thread.
//!
//! The manager binds a transaction for the duration of each attempt and
//! restores whatever was bound before when the attempt ends, so nested
//! `RequiresNew` transactions shadow the outer one and then hand it back.

use super::handle::Tx;
use crate::error::{TxError, TxResult};
use std::cell::RefCell;

thread_local! {
    static CURRENT: RefCell<Option<Tx>> = const { RefCell::new(None) };
}

/// Returns true if a transaction is bound to this thread.
pub fn exists() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}

/// Returns the transaction bound to this thread.
pub fn get() -> TxResult<Tx> {
    CURRENT.with(|c| c.borrow().clone().ok_or(TxError::NoActiveTransaction))
}

/// Binds `tx` until the returned guard is dropped.
pub(crate) fn bind(tx: Tx) -> Binding {
    let previous = CURRENT.with(|c| c.replace(Some(tx)));
    Binding { previous }
}

/// Restores the previously bound transaction on drop.
pub(crate) struct Binding {
    previous: Option<Tx>,
}

impl Drop for Binding {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|c| {
            c.replace(previous);
        });
    }
}
