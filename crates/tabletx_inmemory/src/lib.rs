//! # tabletx In-Memory
//!
//! An in-process [`Repository`](tabletx_core::Repository) for tabletx.
//!
//! Rows live in memory, keyed by table and encoded id. Each row carries the
//! commit sequence that last wrote it, which is what optimistic conflict
//! detection compares on commit. Streaming scans are served by a producer
//! thread feeding the caller's handoff queue.
//!
//! Useful for integration tests of code built on
//! [`TxManager`](tabletx_core::TxManager), and as a reference for what a
//! real backend has to provide.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod repository;
mod store;
mod transaction;

pub use repository::InMemoryRepository;
