//! Cache Pool Module
//!
//! Item-level cache layer: a bounded buffer of recent lookups in front of one
//! backend engine, plus a queue of deferred saves.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::{CacheItem, ItemBuffer, PoolStats, DEFAULT_BUFFER_SIZE};
use crate::context::CacheContext;
use crate::engine::{CacheEngine, Ttl};
use crate::error::{CacheError, Result};

// == Commit Report ==
/// Outcome of [`CachePool::commit`].
#[derive(Debug, Default)]
pub struct CommitReport {
    /// Keys persisted, in queue order
    pub saved: Vec<String>,
    /// Keys that could not be persisted, with the reason
    pub failed: Vec<(String, CacheError)>,
}

impl CommitReport {
    /// True when every queued item was persisted.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

// == Cache Pool ==
/// Item cache backed by a single engine.
///
/// The pool owns its buffer and deferred queue; share it across threads
/// behind a lock.
pub struct CachePool {
    /// Backend engine
    engine: Arc<dyn CacheEngine>,
    /// Recently seen items
    buffer: ItemBuffer,
    /// Items waiting for `commit`
    deferred: Vec<CacheItem>,
    /// Request flags
    context: CacheContext,
    /// Performance statistics
    stats: PoolStats,
}

impl fmt::Debug for CachePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePool")
            .field("buffer", &self.buffer)
            .field("deferred", &self.deferred)
            .field("context", &self.context)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl CachePool {
    // == Constructor ==
    /// Creates a pool over `engine` with the default buffer size.
    pub fn new(engine: Arc<dyn CacheEngine>) -> Self {
        Self::with_buffer_size(engine, DEFAULT_BUFFER_SIZE)
    }

    /// Creates a pool holding at most `buffer_size` items in memory.
    ///
    /// # Arguments
    /// * `engine` - Backend the pool reads from and writes to
    /// * `buffer_size` - Buffer capacity; zero disables buffering
    pub fn with_buffer_size(engine: Arc<dyn CacheEngine>, buffer_size: usize) -> Self {
        Self {
            engine,
            buffer: ItemBuffer::new(buffer_size),
            deferred: Vec::new(),
            context: CacheContext::default(),
            stats: PoolStats::new(),
        }
    }

    /// Applies request flags to every later operation.
    pub fn with_context(mut self, context: CacheContext) -> Self {
        self.context = context;
        self
    }

    pub fn set_context(&mut self, context: CacheContext) {
        self.context = context;
    }

    pub fn context(&self) -> CacheContext {
        self.context
    }

    pub fn engine(&self) -> Arc<dyn CacheEngine> {
        Arc::clone(&self.engine)
    }

    // == Get Item ==
    /// Returns the item for `key`, always; check [`CacheItem::is_hit`].
    ///
    /// A fresh buffered item is returned without touching the backend.
    /// Anything else is looked up and buffered, misses included.
    pub fn get_item(&mut self, key: &str) -> Result<CacheItem> {
        if self.context.skip_reads() {
            debug!("Cache reads disabled, skipping '{}'", key);
            self.stats.record_miss();
            return Ok(CacheItem::new(key));
        }

        if let Some(item) = self.buffer.get(key) {
            if !item.is_stale() {
                let item = item.clone();
                if item.is_hit() {
                    self.stats.record_buffer_hit();
                } else {
                    self.stats.record_miss();
                }
                return Ok(item);
            }
        }

        let item = CacheItem::from_lookup(key, self.engine.get(key)?);
        if item.is_hit() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }

        self.remember(item.clone());
        Ok(item)
    }

    /// Looks up several keys, in order.
    pub fn get_items(&mut self, keys: &[&str]) -> Result<Vec<CacheItem>> {
        keys.iter().map(|key| self.get_item(key)).collect()
    }

    // == Has Item ==
    pub fn has_item(&mut self, key: &str) -> Result<bool> {
        if self.context.skip_reads() {
            return Ok(false);
        }

        match self.buffer.get(key) {
            Some(item) if !item.is_stale() => Ok(item.is_hit()),
            _ => self.engine.has(key),
        }
    }

    // == Clear ==
    /// Empties the backend, the buffer and the deferred queue.
    pub fn clear(&mut self) -> Result<bool> {
        self.buffer.clear();
        self.deferred.clear();
        self.engine.clear()
    }

    // == Delete ==
    /// Deletes `key`. The buffered copy is dropped whatever the backend says.
    pub fn delete_item(&mut self, key: &str) -> Result<bool> {
        self.buffer.remove(key);
        self.engine.delete(key)
    }

    pub fn delete_items(&mut self, keys: &[&str]) -> Result<bool> {
        for key in keys {
            self.buffer.remove(key);
        }
        self.engine.delete_multiple(keys)
    }

    // == Save ==
    /// Persists an item for the seconds it has left.
    ///
    /// Fails with `InvalidArgument` when less than a second remains.
    pub fn save(&mut self, item: CacheItem) -> Result<bool> {
        let ttl = item.expires_in_secs();
        if ttl < 1 {
            return Err(CacheError::InvalidArgument(format!(
                "Object has expired: '{}'",
                item.key()
            )));
        }

        if self.context.skip_writes() {
            debug!("Cache writes disabled, skipping '{}'", item.key());
            return Ok(true);
        }

        let value = item.get().cloned().unwrap_or(Value::Null);
        let stored = self.engine.set(item.key(), value, Some(Ttl::Seconds(ttl)))?;
        if stored {
            self.stats.record_save();
            self.remember(item);
        }
        Ok(stored)
    }

    /// Queues an item until the next [`commit`](Self::commit).
    pub fn save_deferred(&mut self, item: CacheItem) -> bool {
        self.deferred.push(item);
        true
    }

    // == Commit ==
    /// Saves every queued item in order and empties the queue.
    ///
    /// A failing item does not stop the rest and is not retried; the report
    /// lists it with its error.
    pub fn commit(&mut self) -> CommitReport {
        let mut report = CommitReport::default();

        for item in std::mem::take(&mut self.deferred) {
            let key = item.key().to_string();
            match self.save(item) {
                Ok(true) => report.saved.push(key),
                Ok(false) => {
                    warn!("Deferred save of '{}' was not stored", key);
                    report.failed.push((
                        key,
                        CacheError::Storage("Backend did not store the item".to_string()),
                    ));
                }
                Err(e) => {
                    warn!("Deferred save of '{}' failed: {}", key, e);
                    report.failed.push((key, e));
                }
            }
        }

        report
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    // == Buffer ==
    pub fn buffer_size(&self) -> usize {
        self.buffer.capacity()
    }

    /// Resizes the buffer; shrinking drops the oldest items.
    pub fn set_buffer_size(&mut self, size: usize) {
        let evicted = self.buffer.set_capacity(size);
        self.stats.record_evictions(evicted.len());
    }

    /// Keys currently buffered, oldest first.
    pub fn buffered_keys(&self) -> Vec<String> {
        self.buffer.keys().map(str::to_string).collect()
    }

    fn remember(&mut self, item: CacheItem) {
        if let Some(evicted) = self.buffer.insert(item) {
            debug!("Evicted '{}' from pool buffer", evicted);
            self.stats.record_evictions(1);
        }
    }

    // == Status ==
    pub fn is_available(&self) -> bool {
        self.engine.is_available()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}
