//! In-memory store
//!
//! Nothing survives the process; useful when QoS bookkeeping is wanted without
//! touching the disk.

use super::{BoxError, MessageStore, StoreError, StoredPacket, MEMORY_STORE};
use crate::config::StoreConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Default)]
struct MemoryInner {
    opened: bool,
    messages: HashMap<String, StoredPacket>,
}

/// Map-backed store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_open<T>(
        &self,
        op: impl FnOnce(&mut HashMap<String, StoredPacket>) -> T,
    ) -> Result<T, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.opened {
            return Err(StoreError::NotOpen {
                store: MEMORY_STORE,
            });
        }
        Ok(op(&mut inner.messages))
    }
}

impl MessageStore for MemoryStore {
    fn name(&self) -> &'static str {
        MEMORY_STORE
    }

    fn open(&self) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .opened = true;
        Ok(())
    }

    fn close(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .opened = false;
    }

    fn put(&self, key: &str, packet: &StoredPacket) -> Result<(), StoreError> {
        self.with_open(|messages| {
            messages.insert(key.to_string(), packet.clone());
        })
    }

    fn get(&self, key: &str) -> Result<Option<StoredPacket>, StoreError> {
        self.with_open(|messages| messages.get(key).cloned())
    }

    fn all(&self) -> Result<Vec<String>, StoreError> {
        self.with_open(|messages| {
            let mut keys: Vec<String> = messages.keys().cloned().collect();
            keys.sort();
            keys
        })
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        self.with_open(|messages| {
            messages.remove(key);
        })
    }

    fn reset(&self) -> Result<(), StoreError> {
        self.with_open(|messages| messages.clear())
    }
}

/// Registry constructor; the memory store takes no parameters
pub fn new_memory_store(_config: &StoreConfig) -> Result<Arc<dyn MessageStore>, BoxError> {
    Ok(Arc::new(MemoryStore::new()))
}
