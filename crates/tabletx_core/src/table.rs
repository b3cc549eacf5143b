//! Typed table access inside a transaction.
//!
//! Point reads go through the first-level cache; writes update the cache
//! as they are issued, so later reads in the same transaction see them.

use crate::config::ScanOptions;
use crate::entity::{decode, encode, Entity};
use crate::error::{TxError, TxResult};
use crate::queue::{handoff_queue, QueueConsumer};
use crate::repository::Row;
use crate::transaction::{PendingWrite, Tx};
use std::marker::PhantomData;

/// Access to the table of entity type `E` within one transaction.
pub struct Table<E: Entity> {
    tx: Tx,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Table<E> {
    pub(crate) fn new(tx: Tx) -> Self {
        Self {
            tx,
            _entity: PhantomData,
        }
    }

    /// Finds an entity by id.
    pub fn find(&self, id: &E::Id) -> TxResult<Option<E>> {
        self.tx.cache().get::<E, _>(id, |id| {
            let key = encode(id)?;
            self.tx.log().debug(format!("find {}/{:?}", E::TABLE, id));
            let row = self.tx.with_physical(|p| p.find(E::TABLE, &key))?;
            row.map(|bytes| decode::<E>(&bytes)).transpose()
        })
    }

    /// Returns true if an entity with this id exists.
    pub fn exists(&self, id: &E::Id) -> TxResult<bool> {
        Ok(self.find(id)?.is_some())
    }

    /// Inserts or replaces an entity.
    pub fn save(&self, entity: E) -> TxResult<()> {
        self.tx.check_writable()?;
        let id = entity.id();
        self.tx.log().info(format!("upsert {}/{:?}", E::TABLE, id));
        self.tx.write(PendingWrite::Upsert {
            table: E::TABLE,
            key: encode(&id)?,
            value: encode(&entity)?,
        })?;
        self.tx.cache().put(entity);
        Ok(())
    }

    /// Inserts an entity that must not already be known to this
    /// transaction as present.
    pub fn insert(&self, entity: E) -> TxResult<()> {
        let id = entity.id();
        if matches!(self.tx.cache().peek::<E>(&id), Some(Some(_))) {
            return Err(TxError::invalid_operation(format!(
                "{}/{:?} already exists in this transaction",
                E::TABLE,
                id
            )));
        }
        self.save(entity)
    }

    /// Deletes an entity by id. Deleting a missing entity is not an error.
    pub fn delete(&self, id: &E::Id) -> TxResult<()> {
        self.tx.check_writable()?;
        self.tx.log().info(format!("delete {}/{:?}", E::TABLE, id));
        self.tx.write(PendingWrite::Delete {
            table: E::TABLE,
            key: encode(id)?,
        })?;
        self.tx.cache().put_empty::<E>(id.clone());
        Ok(())
    }

    /// Returns every entity of the table, ordered by id.
    ///
    /// Entities already cached by this transaction take precedence over the
    /// loaded rows, so unflushed writes and deletes are reflected.
    pub fn find_all(&self) -> TxResult<Vec<E>> {
        self.tx.log().debug(format!("find all {}", E::TABLE));
        let rows = self.tx.with_physical(|p| p.find_all(E::TABLE))?;
        let mut loaded = rows
            .iter()
            .map(|row| decode::<E>(&row.value))
            .collect::<TxResult<Vec<E>>>()?;

        let cache = self.tx.cache();
        if !cache.is_enabled() {
            loaded.sort_by_key(|e| e.id());
            return Ok(loaded);
        }
        for entity in loaded {
            if !cache.contains_key::<E>(&entity.id()) {
                cache.put(entity);
            }
        }
        Ok(cache.snapshot::<E>())
    }

    /// Streams every committed entity of the table in key order.
    ///
    /// Rows are handed over through a bounded queue sized and deadlined by
    /// the transaction's scan options (defaults outside scans). The stream
    /// fails with `ResultTruncated` once it yields more than `max_size`
    /// entities. Writes made by this transaction are not visible.
    pub fn stream_all(&self) -> TxResult<EntityStream<E>> {
        let scan = self.tx.options().scan.unwrap_or_default();
        self.tx.log().debug(format!("stream all {}", E::TABLE));
        let (producer, consumer) = handoff_queue(scan.queue_capacity, scan.timeout);
        self.tx.with_physical(|p| p.stream_all(E::TABLE, producer))?;
        Ok(EntityStream::new(consumer, scan))
    }
}

/// Iterator over a streamed table.
///
/// Dropping the stream closes the queue, which tells the producer to stop.
pub struct EntityStream<E: Entity> {
    rows: QueueConsumer<Row>,
    max_size: usize,
    yielded: usize,
    done: bool,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> EntityStream<E> {
    fn new(rows: QueueConsumer<Row>, scan: ScanOptions) -> Self {
        Self {
            rows,
            max_size: scan.max_size,
            yielded: 0,
            done: false,
            _entity: PhantomData,
        }
    }

    /// Stops the stream early.
    pub fn close(&mut self) {
        self.done = true;
        self.rows.close();
    }

    fn fail(&mut self, err: TxError) -> Option<TxResult<E>> {
        self.close();
        Some(Err(err))
    }
}

impl<E: Entity> Iterator for EntityStream<E> {
    type Item = TxResult<E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.rows.poll() {
            Ok(Some(row)) => {
                if self.yielded >= self.max_size {
                    return self.fail(TxError::ResultTruncated {
                        limit: self.max_size,
                    });
                }
                self.yielded += 1;
                match decode::<E>(&row.value) {
                    Ok(entity) => Some(Ok(entity)),
                    Err(e) => self.fail(e),
                }
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => self.fail(e),
        }
    }
}
