//! In-process store backend.

use std::sync::RwLock;

use hashbrown::HashMap;
use satchel_core::StoreName;

use crate::{CacheEntry, CacheStorage, RequestKey, StoreError, StoreResult};

type Stores = HashMap<StoreName, HashMap<RequestKey, CacheEntry>>;

/// Store backend held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    stores: RwLock<Stores>,
}

impl MemoryCacheStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Stores) -> T) -> StoreResult<T> {
        let stores = self.stores.read().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&stores))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Stores) -> T) -> StoreResult<T> {
        let mut stores = self.stores.write().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&mut stores))
    }
}

impl CacheStorage for MemoryCacheStorage {
    fn open(&self, name: &StoreName) -> StoreResult<()> {
        self.write(|stores| {
            stores.entry(name.clone()).or_default();
        })
    }

    fn has(&self, name: &StoreName) -> StoreResult<bool> {
        self.read(|stores| stores.contains_key(name))
    }

    fn keys(&self) -> StoreResult<Vec<StoreName>> {
        let mut names = self.read(|stores| stores.keys().cloned().collect::<Vec<_>>())?;
        names.sort();
        Ok(names)
    }

    fn delete(&self, name: &StoreName) -> StoreResult<bool> {
        self.write(|stores| stores.remove(name).is_some())
    }

    fn put(&self, name: &StoreName, entry: CacheEntry) -> StoreResult<()> {
        self.write(|stores| {
            stores
                .entry(name.clone())
                .or_default()
                .insert(entry.key.clone(), entry);
        })
    }

    fn match_request(&self, name: &StoreName, key: &RequestKey) -> StoreResult<Option<CacheEntry>> {
        self.read(|stores| stores.get(name).and_then(|store| store.get(key)).cloned())
    }

    fn entry_count(&self, name: &StoreName) -> StoreResult<usize> {
        self.read(|stores| stores.get(name).map(|store| store.len()).unwrap_or(0))
    }
}
