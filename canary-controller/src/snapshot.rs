use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use canary_controller_apis::Canary;

use crate::resource_key::ResourceKey;

#[derive(Default)]
struct Tables {
    entries: HashMap<ResourceKey, Arc<Canary>>,
    /// Keys with an open [`SyncFence`], mapped to whether a delete landed
    /// while the fence was open.
    fences: HashMap<ResourceKey, bool>,
}

/// The controller's own view of the last successfully reconciled [`Canary`]
/// objects, keyed by [`ResourceKey`].
///
/// Shared by the cache event handler (deletes) and the workers (writes); all
/// locking is internal.
#[derive(Default)]
pub(crate) struct SnapshotTable {
    tables: RwLock<Tables>,
}

impl SnapshotTable {
    pub fn new() -> Self {
        Default::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Arc<Canary>> {
        self.read().entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the entry for `key` and invalidate any open fence for it.
    pub fn delete(&self, key: &ResourceKey) -> Option<Arc<Canary>> {
        let mut tables = self.write();
        if let Some(deleted) = tables.fences.get_mut(key) {
            *deleted = true;
        }
        tables.entries.remove(key)
    }

    /// Open a fence for `key` before reading authoritative state.
    ///
    /// The work queue never hands out the same key twice concurrently, so at
    /// most one fence per key is open at any time.
    pub fn begin(&self, key: &ResourceKey) -> SyncFence<'_> {
        self.write().fences.insert(key.clone(), false);
        SyncFence {
            table: self,
            key: key.clone(),
        }
    }
}

/// Guards a snapshot write against deletes which happen between reading the
/// lister and writing the snapshot.
pub(crate) struct SyncFence<'a> {
    table: &'a SnapshotTable,
    key: ResourceKey,
}

impl SyncFence<'_> {
    /// Store `canary` unless the key was deleted since the fence was opened.
    /// Returns whether the entry was written.
    pub fn commit(self, canary: Arc<Canary>) -> bool {
        let mut tables = self.table.write();
        let deleted = tables.fences.remove(&self.key).unwrap_or(false);
        if deleted {
            false
        } else {
            tables.entries.insert(self.key.clone(), canary);
            true
        }
    }
}

impl Drop for SyncFence<'_> {
    fn drop(&mut self) {
        self.table.write().fences.remove(&self.key);
    }
}
