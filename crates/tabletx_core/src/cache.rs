//! Per-transaction first-level cache.
//!
//! The cache memoizes every entity a transaction has read or written, keyed
//! by entity type and id. An entry is either present, known-absent, or not
//! cached at all; once an entry is cached it is never forgotten for the life
//! of the transaction. This gives read-your-writes and at-most-one-load
//! semantics.
//!
//! The lock is never held while a loader runs, so loaders may call back into
//! the same cache.

use crate::entity::Entity;
use crate::error::TxResult;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};

type Entries<E> = BTreeMap<<E as Entity>::Id, Option<E>>;

/// Memoized entity state for one physical transaction.
pub struct FirstLevelCache {
    /// `None` for a disabled cache.
    tables: Option<Mutex<HashMap<TypeId, Box<dyn Any + Send>>>>,
}

impl FirstLevelCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Some(Mutex::new(HashMap::new())),
        }
    }

    /// Creates a cache that remembers nothing: every `get` calls its loader.
    #[must_use]
    pub fn disabled() -> Self {
        Self { tables: None }
    }

    /// Returns false for a disabled cache.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.tables.is_some()
    }

    /// Returns the cached entity, or loads and memoizes it.
    ///
    /// `loader` runs at most once per id and only if the id is not cached.
    /// A `None` result is memoized as known-absent. A loader error is
    /// returned and nothing is memoized.
    pub fn get<E, F>(&self, id: &E::Id, loader: F) -> TxResult<Option<E>>
    where
        E: Entity,
        F: FnOnce(&E::Id) -> TxResult<Option<E>>,
    {
        let Some(tables) = &self.tables else {
            return loader(id);
        };

        if let Some(cached) = Self::with_entries::<E, _>(&mut tables.lock(), |e| e.get(id).cloned())
        {
            return Ok(cached);
        }

        let loaded = loader(id)?;
        let mut guard = tables.lock();
        Ok(Self::with_entries::<E, _>(&mut guard, |e| {
            e.entry(id.clone()).or_insert(loaded).clone()
        }))
    }

    /// Returns the cached state without loading: `None` if not cached,
    /// `Some(None)` if known-absent.
    pub fn peek<E: Entity>(&self, id: &E::Id) -> Option<Option<E>> {
        let tables = self.tables.as_ref()?;
        Self::with_entries::<E, _>(&mut tables.lock(), |e| e.get(id).cloned())
    }

    /// Memoizes `entity` as present, replacing any previous entry.
    pub fn put<E: Entity>(&self, entity: E) {
        if let Some(tables) = &self.tables {
            Self::with_entries::<E, _>(&mut tables.lock(), |e| {
                e.insert(entity.id(), Some(entity));
            });
        }
    }

    /// Memoizes `id` as known-absent.
    pub fn put_empty<E: Entity>(&self, id: E::Id) {
        if let Some(tables) = &self.tables {
            Self::with_entries::<E, _>(&mut tables.lock(), |e| {
                e.insert(id, None);
            });
        }
    }

    /// Returns true if `id` is cached, present or absent.
    pub fn contains_key<E: Entity>(&self, id: &E::Id) -> bool {
        self.peek::<E>(id).is_some()
    }

    /// Returns a copy of every present entity of type `E`, ordered by id.
    pub fn snapshot<E: Entity>(&self) -> Vec<E> {
        let Some(tables) = &self.tables else {
            return Vec::new();
        };
        Self::with_entries::<E, _>(&mut tables.lock(), |e| {
            e.values().filter_map(|v| v.clone()).collect()
        })
    }

    fn with_entries<E: Entity, R>(
        tables: &mut HashMap<TypeId, Box<dyn Any + Send>>,
        f: impl FnOnce(&mut Entries<E>) -> R,
    ) -> R {
        let slot = tables
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(Entries::<E>::new()));
        match slot.downcast_mut::<Entries<E>>() {
            Some(entries) => f(entries),
            // Keyed by TypeId::of::<E>, so the slot always holds Entries<E>.
            None => unreachable!("cache slot holds a different entity type"),
        }
    }
}

impl Default for FirstLevelCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FirstLevelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let types = self.tables.as_ref().map(|t| t.lock().len());
        f.debug_struct("FirstLevelCache")
            .field("enabled", &self.is_enabled())
            .field("entity_types", &types)
            .finish()
    }
}
