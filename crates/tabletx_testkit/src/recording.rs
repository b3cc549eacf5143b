//! A repository decorator that records every call.

use parking_lot::Mutex;
use std::sync::Arc;
use tabletx_core::{
    QueueProducer, Repository, RepositoryTransaction, Row, TxOptions, TxResult,
};

/// A call made against a [`RecordingRepository`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A transaction was started (or failed to start).
    Start,
    /// A point read.
    Find(String),
    /// A full table read.
    FindAll(String),
    /// An upsert.
    Upsert(String),
    /// A delete.
    Delete(String),
    /// A streaming scan.
    StreamAll(String),
    /// A commit; `true` if it succeeded.
    Commit(bool),
    /// A rollback.
    Rollback,
}

/// Wraps a repository and records the calls made through it, in order.
#[derive(Debug, Clone)]
pub struct RecordingRepository<R> {
    inner: R,
    events: Arc<Mutex<Vec<Event>>>,
}

impl<R: Repository> RecordingRepository<R> {
    /// Wraps `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns the wrapped repository.
    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Returns the recorded events.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Returns how many recorded events satisfy `pred`.
    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    /// Forgets recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl<R: Repository> Repository for RecordingRepository<R> {
    fn start_transaction(&self, options: &TxOptions) -> TxResult<Box<dyn RepositoryTransaction>> {
        self.events.lock().push(Event::Start);
        let inner = self.inner.start_transaction(options)?;
        Ok(Box::new(RecordingTransaction {
            inner,
            events: Arc::clone(&self.events),
        }))
    }
}

struct RecordingTransaction {
    inner: Box<dyn RepositoryTransaction>,
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingTransaction {
    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl RepositoryTransaction for RecordingTransaction {
    fn options(&self) -> &TxOptions {
        self.inner.options()
    }

    fn find(&mut self, table: &str, key: &[u8]) -> TxResult<Option<Vec<u8>>> {
        self.record(Event::Find(table.to_string()));
        self.inner.find(table, key)
    }

    fn find_all(&mut self, table: &str) -> TxResult<Vec<Row>> {
        self.record(Event::FindAll(table.to_string()));
        self.inner.find_all(table)
    }

    fn upsert(&mut self, table: &str, key: Vec<u8>, value: Vec<u8>) -> TxResult<()> {
        self.record(Event::Upsert(table.to_string()));
        self.inner.upsert(table, key, value)
    }

    fn delete(&mut self, table: &str, key: Vec<u8>) -> TxResult<()> {
        self.record(Event::Delete(table.to_string()));
        self.inner.delete(table, key)
    }

    fn stream_all(&mut self, table: &str, sink: QueueProducer<Row>) -> TxResult<()> {
        self.record(Event::StreamAll(table.to_string()));
        self.inner.stream_all(table, sink)
    }

    fn commit(&mut self) -> TxResult<()> {
        let result = self.inner.commit();
        self.record(Event::Commit(result.is_ok()));
        result
    }

    fn rollback(&mut self) -> TxResult<()> {
        self.record(Event::Rollback);
        self.inner.rollback()
    }
}
