//! Cache Engine Module
//!
//! The uniform key/value contract every backend implements, the optional
//! capability sets layered on top of it, and the concrete backends.
//!
//! # Capabilities
//! - [`CacheEngine`]: get / set / delete / has / clear, plus bulk variants
//! - [`CacheLock`]: advisory lock / unlock
//! - [`AtomicOperation`]: increment / decrement / add-to-list
//! - [`GarbageCollector`]: eager expiry sweep and TTL inspection
//!
//! An [`Engine`] bundles one backend with whichever capabilities it
//! supports, decided when the bundle is built.

mod array;
mod base;
mod codec;
mod entry;
mod filesystem;
mod lazy;
mod lock;
mod memcached;
mod null;
mod redis;
mod session;
#[cfg(target_os = "linux")]
mod shmop;

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::Result;

// Re-export public types
pub use array::ArrayCacheEngine;
pub use base::{
    add_to_now, convert_to_seconds, now_timestamp, resolve_key, KeyResolver, StaticKeyResolver,
    Ttl,
};
pub use codec::{decode, decode_lenient, encode};
pub use filesystem::{FileSystemCacheEngine, TMPFS_PATH};
pub use lazy::Connector;
pub use lock::{AdvisoryLock, LockWait, SentinelFileLock, DEFAULT_LOCK_TIMEOUT, DEFAULT_POLL_INTERVAL};
pub use memcached::{MemcachedClient, MemcachedEngine, DEFAULT_SERVER as MEMCACHED_DEFAULT_SERVER};
pub use null::NoCacheEngine;
pub use self::redis::{RedisCacheEngine, RedisClient, RedisType, DEFAULT_SERVER as REDIS_DEFAULT_SERVER};
pub use session::{Session, SessionCacheEngine};
#[cfg(target_os = "linux")]
pub use shmop::{ShmopCacheEngine, ShmopConfig};

#[cfg(feature = "memcached")]
pub use memcached::memcache_connector;
#[cfg(feature = "redis")]
pub use self::redis::redis_connector;

// == Public Constants ==
/// Upper bound on compare-and-swap attempts in the remote `add` loops
pub const MAX_CAS_ATTEMPTS: usize = 64;

/// Outcome of a bulk read: one entry per requested key, in request order.
pub type BulkGet = Vec<(String, Result<Option<Value>>)>;

// == Basic Capability ==
/// The key/value contract shared by every backend.
pub trait CacheEngine: Send + Sync {
    /// Returns the stored value, or `None` if absent or expired.
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Stores a value. `None` (or a zero TTL) means no expiration.
    fn set(&self, key: &str, value: Value, ttl: Option<Ttl>) -> Result<bool>;

    /// Removes a key. Deleting an absent key succeeds.
    fn delete(&self, key: &str) -> Result<bool>;

    /// Same expiration check as `get`.
    ///
    /// A positive answer may be stale by the time `get` runs if another
    /// process deletes the key in between; callers must tolerate that.
    fn has(&self, key: &str) -> Result<bool>;

    /// Removes every entry this engine created.
    fn clear(&self) -> Result<bool>;

    /// Probes whether the backend can be used right now. Never fails.
    fn is_available(&self) -> bool;

    /// Returns the stored value, or `default` on a miss. A stored null is a miss.
    fn get_or(&self, key: &str, default: Value) -> Result<Value> {
        Ok(self.get(key)?.filter(|v| !v.is_null()).unwrap_or(default))
    }

    /// Reads every key in order. A failing key does not stop the others.
    fn get_multiple(&self, keys: &[&str]) -> BulkGet {
        keys.iter()
            .map(|key| (key.to_string(), self.get(key)))
            .collect()
    }

    /// Writes every pair in order.
    ///
    /// All pairs are attempted; the first error, if any, is returned after
    /// the last pair has been tried.
    fn set_multiple(&self, values: Vec<(String, Value)>, ttl: Option<Ttl>) -> Result<bool> {
        let mut all_stored = true;
        let mut first_error = None;

        for (key, value) in values {
            match self.set(&key, value, ttl) {
                Ok(stored) => all_stored &= stored,
                Err(e) => {
                    warn!("Bulk set of '{}' failed: {}", key, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(all_stored),
        }
    }

    /// Deletes every key in order, with the same error policy as `set_multiple`.
    fn delete_multiple(&self, keys: &[&str]) -> Result<bool> {
        let mut first_error = None;

        for key in keys {
            if let Err(e) = self.delete(key) {
                warn!("Bulk delete of '{}' failed: {}", key, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }
}

// == Typed Access ==
/// Typed get/set for any serde type, available on every engine.
pub trait CacheEngineExt: CacheEngine {
    /// Reads and deserializes a value.
    fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(value) if !value.is_null() => Ok(Some(serde_json::from_value(value)?)),
            _ => Ok(None),
        }
    }

    /// Serializes and stores a value.
    fn set_as<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Ttl>) -> Result<bool> {
        self.set(key, serde_json::to_value(value)?, ttl)
    }
}

impl<E: CacheEngine + ?Sized> CacheEngineExt for E {}

// == Locking Capability ==
/// Advisory write locks on individual keys.
pub trait CacheLock: Send + Sync {
    fn lock(&self, key: &str) -> Result<()>;

    fn unlock(&self, key: &str) -> Result<()>;
}

// == Atomic Capability ==
/// Read-modify-write operations performed under the backend's own guard.
pub trait AtomicOperation: Send + Sync {
    /// Adds `by` to a numeric value (absent counts as zero) and returns the result.
    fn increment(&self, key: &str, by: i64, ttl: Option<Ttl>) -> Result<i64>;

    /// Subtracts `by` from a numeric value and returns the result.
    fn decrement(&self, key: &str, by: i64, ttl: Option<Ttl>) -> Result<i64>;

    /// Appends `value` to the list stored at `key` and returns the new list.
    ///
    /// An absent key starts an empty list; a scalar becomes the list's first element.
    fn add(&self, key: &str, value: Value, ttl: Option<Ttl>) -> Result<Vec<Value>>;
}

// == Garbage Collecting Capability ==
/// Eager expiration for engines that otherwise expire lazily.
pub trait GarbageCollector: Send + Sync {
    /// Purges every expired entry and returns how many were removed.
    fn collect_garbage(&self) -> Result<usize>;

    /// Absolute expiry (Unix seconds) recorded for `key`, if any.
    fn get_ttl(&self, key: &str) -> Result<Option<i64>>;
}

/// Appends to a list value following the add-to-list rules.
pub(crate) fn append_to_list(current: Option<Value>, value: Value) -> Vec<Value> {
    let mut list = match current {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(Value::String(s)) if s.is_empty() => Vec::new(),
        Some(other) => vec![other],
    };
    list.push(value);
    list
}

// == Engine Bundle ==
/// A backend together with the capability sets it supports.
#[derive(Clone)]
pub struct Engine {
    basic: Arc<dyn CacheEngine>,
    locking: Option<Arc<dyn CacheLock>>,
    atomic: Option<Arc<dyn AtomicOperation>>,
    garbage_collector: Option<Arc<dyn GarbageCollector>>,
}

impl Engine {
    /// Bundles a backend that only offers the basic contract.
    pub fn new(basic: Arc<dyn CacheEngine>) -> Self {
        Self {
            basic,
            locking: None,
            atomic: None,
            garbage_collector: None,
        }
    }

    pub fn with_locking(mut self, locking: Arc<dyn CacheLock>) -> Self {
        self.locking = Some(locking);
        self
    }

    pub fn with_atomic(mut self, atomic: Arc<dyn AtomicOperation>) -> Self {
        self.atomic = Some(atomic);
        self
    }

    pub fn with_garbage_collector(mut self, gc: Arc<dyn GarbageCollector>) -> Self {
        self.garbage_collector = Some(gc);
        self
    }

    /// The basic contract.
    pub fn basic(&self) -> Arc<dyn CacheEngine> {
        Arc::clone(&self.basic)
    }

    pub fn locking(&self) -> Option<Arc<dyn CacheLock>> {
        self.locking.clone()
    }

    pub fn atomic(&self) -> Option<Arc<dyn AtomicOperation>> {
        self.atomic.clone()
    }

    pub fn garbage_collector(&self) -> Option<Arc<dyn GarbageCollector>> {
        self.garbage_collector.clone()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("locking", &self.locking.is_some())
            .field("atomic", &self.atomic.is_some())
            .field("garbage_collector", &self.garbage_collector.is_some())
            .finish()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Model {
        a: i32,
        b: i32,
    }

    #[test]
    fn test_append_to_list_rules() {
        assert_eq!(append_to_list(None, json!(10)), vec![json!(10)]);
        assert_eq!(
            append_to_list(Some(json!([10])), json!(20)),
            vec![json!(10), json!(20)]
        );
        assert_eq!(
            append_to_list(Some(json!("x")), json!(20)),
            vec![json!("x"), json!(20)]
        );
    }

    #[test]
    fn test_typed_access() {
        let engine = ArrayCacheEngine::new();
        let model = Model { a: 10, b: 20 };

        engine.set_as("chave", &model, None).unwrap();
        assert_eq!(engine.get_as::<Model>("chave").unwrap(), Some(model));
        assert_eq!(engine.get_as::<Model>("missing").unwrap(), None);
    }

    #[test]
    fn test_bulk_operations_keep_order() {
        let engine = ArrayCacheEngine::new();
        engine
            .set_multiple(
                vec![
                    ("chave1".to_string(), json!("valor1")),
                    ("chave2".to_string(), json!("valor2")),
                ],
                None,
            )
            .unwrap();

        let results = engine.get_multiple(&["chave2", "missing", "chave1"]);
        let keys: Vec<&str> = results.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["chave2", "missing", "chave1"]);
        assert_eq!(results[0].1.as_ref().unwrap(), &Some(json!("valor2")));
        assert_eq!(results[1].1.as_ref().unwrap(), &None);

        engine.delete_multiple(&["chave1", "chave2"]).unwrap();
        assert!(!engine.has("chave1").unwrap());
        assert!(!engine.has("chave2").unwrap());
    }

    #[test]
    fn test_bulk_errors_do_not_abort() {
        let resolver = StaticKeyResolver::new().with("known", "physical");
        let engine = ArrayCacheEngine::new().with_key_resolver(Arc::new(resolver));

        let result = engine.set_multiple(
            vec![
                ("unknown".to_string(), json!(1)),
                ("known".to_string(), json!(2)),
            ],
            None,
        );

        assert!(result.unwrap_err().is_invalid_argument());
        assert_eq!(engine.get("known").unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_engine_bundle_capabilities() {
        let engine: Engine = ArrayCacheEngine::new().into();
        assert!(engine.garbage_collector().is_some());
        assert!(engine.locking().is_none());
        assert!(engine.atomic().is_none());
    }
}
