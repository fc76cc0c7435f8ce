// ABOUTME: Concurrent stream id registry shared by the session tasks and user handles
// ABOUTME: Iteration snapshots the map so callbacks may mutate it without deadlocking

use crate::frame::StreamId;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// A reader/writer-locked `id -> value` map.
///
/// `snapshot` clones the current entries out from under the lock, so
/// callers can remove or insert while walking the result.
#[derive(Debug)]
pub(crate) struct StreamMap<T> {
    inner: RwLock<HashMap<StreamId, T>>,
}

impl<T: Clone> StreamMap<T> {
    pub fn new() -> StreamMap<T> {
        StreamMap {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: StreamId) -> Option<T> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Insert `value` under `id`. Returns false if the id was taken.
    pub fn insert(&self, id: StreamId, value: T) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match map.entry(id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(value);
                true
            }
        }
    }

    pub fn remove(&self, id: StreamId) -> Option<T> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn snapshot(&self) -> Vec<(StreamId, T)> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, value)| (*id, value.clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
