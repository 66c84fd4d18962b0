//! Array Cache Engine
//!
//! In-process map engine with lazy TTL expiration and an explicit garbage
//! collection sweep.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use super::base::{add_to_now, now_timestamp, resolve_key, KeyResolver, Ttl};
use super::entry::StoredEntry;
use super::{CacheEngine, Engine, GarbageCollector};
use crate::error::Result;

// == Array Cache Engine ==
/// Keeps entries in a process-local map.
#[derive(Default)]
pub struct ArrayCacheEngine {
    /// Key-value storage
    entries: Mutex<HashMap<String, StoredEntry>>,
    /// Optional logical-to-physical key remap
    resolver: Option<Arc<dyn KeyResolver>>,
}

impl ArrayCacheEngine {
    // == Constructor ==
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes every key through `resolver` before touching storage.
    pub fn with_key_resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    fn fix_key(&self, key: &str) -> Result<String> {
        resolve_key(self.resolver.as_deref(), key)
    }

    // == Length ==
    /// Number of entries held, expired ones included until they are observed.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl CacheEngine for ArrayCacheEngine {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let key = self.fix_key(key)?;
        let mut entries = self.entries.lock();

        match entries.get(&key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(&key);
                debug!("[Array cache] Expired '{}'", key);
                Ok(None)
            }
            Some(entry) => {
                debug!("[Array cache] Get '{}' from L1 Cache", key);
                Ok(Some(entry.value.clone()))
            }
            None => {
                debug!("[Array cache] Not found '{}'", key);
                Ok(None)
            }
        }
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Ttl>) -> Result<bool> {
        let key = self.fix_key(key)?;
        if value.is_null() {
            self.entries.lock().remove(&key);
            return Ok(true);
        }

        debug!("[Array cache] Set '{}' in L1 Cache", key);

        let entry = StoredEntry::new(value, add_to_now(ttl));
        self.entries.lock().insert(key, entry);
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let key = self.fix_key(key)?;
        self.entries.lock().remove(&key);
        Ok(true)
    }

    fn has(&self, key: &str) -> Result<bool> {
        let key = self.fix_key(key)?;
        let mut entries = self.entries.lock();

        match entries.get(&key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(&key);
                Ok(false)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    fn clear(&self) -> Result<bool> {
        self.entries.lock().clear();
        Ok(true)
    }

    fn is_available(&self) -> bool {
        true
    }
}

impl GarbageCollector for ArrayCacheEngine {
    // == Collect Garbage ==
    /// Removes all expired entries and returns how many were dropped.
    fn collect_garbage(&self) -> Result<usize> {
        let now = now_timestamp();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired_at(now));
        Ok(before - entries.len())
    }

    fn get_ttl(&self, key: &str) -> Result<Option<i64>> {
        let key = self.fix_key(key)?;
        Ok(self
            .entries
            .lock()
            .get(&key)
            .and_then(|entry| entry.expires_at))
    }
}

impl From<ArrayCacheEngine> for Engine {
    fn from(engine: ArrayCacheEngine) -> Self {
        let engine = Arc::new(engine);
        Engine::new(engine.clone()).with_garbage_collector(engine)
    }
}
