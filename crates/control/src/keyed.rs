//! Per-key serialized state
//!
//! Every store in the control plane is a map from an id to a slot guarded by
//! its own async mutex. The outer map lock is only held long enough to find or
//! create a slot, so work on different ids never waits on each other while
//! read-modify-write on one id is serialized by the slot lock.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Shared handle to one slot
pub type Slot<T> = Arc<Mutex<T>>;

#[derive(Debug)]
pub struct KeyedSlots<T> {
    slots: RwLock<HashMap<String, Slot<T>>>,
}

impl<T> Default for KeyedSlots<T> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> KeyedSlots<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing slot for `key`, if any
    pub async fn get(&self, key: &str) -> Option<Slot<T>> {
        self.slots.read().await.get(key).cloned()
    }

    /// Existing slot for `key`, or a new one built by `init`
    pub async fn get_or_insert_with<F>(&self, key: &str, init: F) -> Slot<T>
    where
        F: FnOnce() -> T,
    {
        if let Some(slot) = self.get(key).await {
            return slot;
        }
        let mut slots = self.slots.write().await;
        slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(init())))
            .clone()
    }

    /// All slots at the time of the call, unordered
    pub async fn entries(&self) -> Vec<(String, Slot<T>)> {
        self.slots
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }
}

impl<T: Default> KeyedSlots<T> {
    /// Existing slot for `key`, or a default-initialised one
    pub async fn entry(&self, key: &str) -> Slot<T> {
        self.get_or_insert_with(key, T::default).await
    }
}
