//! Memcached Cache Engine
//!
//! Talks to memcached through the [`MemcachedClient`] capability. Physical
//! keys look like `cache-<generation>-<key>`: bumping the generation counter
//! orphans every entry at once, which is how `clear` stays scoped to this
//! engine on a shared server. Orphans age out through the server's LRU.

use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use super::base::{convert_to_seconds, now_timestamp, resolve_key, KeyResolver, Ttl};
use super::codec::{decode_lenient, encode};
use super::lazy::Connector;
use super::{append_to_list, AtomicOperation, CacheEngine, Engine, MAX_CAS_ATTEMPTS};
use crate::error::{CacheError, Result};

// == Constants ==
/// Server used when none is configured
pub const DEFAULT_SERVER: &str = "127.0.0.1:11211";

/// Relative expirations longer than this are read as Unix timestamps by memcached
const MAX_RELATIVE_EXPIRATION: i64 = 60 * 60 * 24 * 30;

const KEY_PREFIX: &str = "cache-";
const GENERATION_KEY: &str = "cache-generation";
/// Longest logical key sent as is; longer keys are hashed
const MAX_PLAIN_KEY_LEN: usize = 200;

// == Client Capability ==
/// Commands the engine needs from a memcached connection.
pub trait MemcachedClient: Send {
    /// Checks the server answers `version`/`stats`.
    fn handshake(&mut self) -> Result<()>;

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Value plus its CAS token.
    fn gets(&mut self, key: &str) -> Result<Option<(Vec<u8>, u64)>>;

    fn set(&mut self, key: &str, value: &[u8], exptime: u32) -> Result<()>;

    /// Stores only if the key is absent. Returns false when it already exists.
    fn add(&mut self, key: &str, value: &[u8], exptime: u32) -> Result<bool>;

    /// Stores only if the CAS token still matches. Returns false on conflict.
    fn cas(&mut self, key: &str, value: &[u8], exptime: u32, token: u64) -> Result<bool>;

    fn delete(&mut self, key: &str) -> Result<()>;

    /// `None` when the key is absent.
    fn increment(&mut self, key: &str, by: u64) -> Result<Option<u64>>;

    /// `None` when the key is absent. The server clamps at zero.
    fn decrement(&mut self, key: &str, by: u64) -> Result<Option<u64>>;

    fn touch(&mut self, key: &str, exptime: u32) -> Result<()>;
}

/// Expiration in memcached's protocol terms.
#[derive(Clone, Copy)]
enum Expiry {
    /// Store with this exptime (0 = never)
    At(u32),
    /// Already expired: remove instead of storing
    Past,
}

/// Maps a TTL onto memcached's exptime rule.
///
/// Up to 30 days the value is relative seconds; beyond that memcached wants
/// an absolute timestamp.
fn expiry(ttl: Option<Ttl>) -> Expiry {
    match convert_to_seconds(ttl) {
        None | Some(0) => Expiry::At(0),
        Some(secs) if secs < 0 => Expiry::Past,
        Some(secs) if secs <= MAX_RELATIVE_EXPIRATION => Expiry::At(secs as u32),
        Some(secs) => Expiry::At(u32::try_from(now_timestamp() + secs).unwrap_or(0)),
    }
}

// == Memcached Engine ==
pub struct MemcachedEngine<C> {
    connector: Connector<C>,
    resolver: Option<Arc<dyn KeyResolver>>,
}

impl<C: MemcachedClient> MemcachedEngine<C> {
    /// The connection is only opened by the first operation.
    pub fn new(connector: Connector<C>) -> Self {
        Self {
            connector,
            resolver: None,
        }
    }

    /// Routes every key through `resolver` before touching storage.
    pub fn with_key_resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    fn logical_key(&self, key: &str) -> Result<String> {
        let key = resolve_key(self.resolver.as_deref(), key)?;
        // Protocol keys cannot hold whitespace or control characters.
        if key.len() > MAX_PLAIN_KEY_LEN || key.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Ok(hex::encode(Sha256::digest(key.as_bytes())));
        }
        Ok(key)
    }

    /// Runs `operation` with the physical key for `key`.
    fn with_key<T>(&self, key: &str, operation: impl FnOnce(&mut C, &str) -> Result<T>) -> Result<T> {
        let key = self.logical_key(key)?;
        self.connector.with(|client| {
            let generation = generation(client)?;
            let physical = format!("{}{}-{}", KEY_PREFIX, generation, key);
            operation(client, &physical)
        })
    }
}

/// Current namespace generation, seeded on first use.
fn generation<C: MemcachedClient>(client: &mut C) -> Result<u64> {
    if let Some(bytes) = client.get(GENERATION_KEY)? {
        return Ok(parse_counter(&bytes));
    }

    if client.add(GENERATION_KEY, b"1", 0)? {
        return Ok(1);
    }
    // Lost the seeding race
    Ok(client.get(GENERATION_KEY)?.map(|b| parse_counter(&b)).unwrap_or(1))
}

fn parse_counter(bytes: &[u8]) -> u64 {
    String::from_utf8_lossy(bytes).trim().parse().unwrap_or(0)
}

impl<C: MemcachedClient> CacheEngine for MemcachedEngine<C> {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        debug!("[Memcached cache] Get '{}'", key);
        self.with_key(key, |client, physical| {
            Ok(client.get(physical)?.map(|bytes| decode_lenient(&bytes)))
        })
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Ttl>) -> Result<bool> {
        let bytes = encode(&value)?;
        debug!("[Memcached cache] Set '{}'", key);

        self.with_key(key, |client, physical| match expiry(ttl) {
            Expiry::Past => client.delete(physical),
            Expiry::At(exptime) => client.set(physical, &bytes, exptime),
        })
        .map_err(|e| {
            error!("[Memcached cache] Could not set '{}': {}", key, e);
            e
        })?;
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        self.with_key(key, |client, physical| client.delete(physical))?;
        Ok(true)
    }

    fn has(&self, key: &str) -> Result<bool> {
        self.with_key(key, |client, physical| Ok(client.get(physical)?.is_some()))
    }

    fn clear(&self) -> Result<bool> {
        self.connector.with(|client| {
            if client.increment(GENERATION_KEY, 1)?.is_none() {
                // No generation yet: start past the implicit first one.
                client.set(GENERATION_KEY, b"2", 0)?;
            }
            Ok(true)
        })
    }

    fn is_available(&self) -> bool {
        self.connector.with(|client| client.handshake()).is_ok()
    }
}

impl<C: MemcachedClient> MemcachedEngine<C> {
    fn counter(&self, key: &str, by: i64, ttl: Option<Ttl>) -> Result<i64> {
        let expiry = expiry(ttl);
        self.with_key(key, |client, physical| {
            let exptime = match expiry {
                Expiry::At(exptime) => exptime,
                Expiry::Past => 0,
            };

            let apply = |client: &mut C| {
                if by >= 0 {
                    client.increment(physical, by as u64)
                } else {
                    client.decrement(physical, by.unsigned_abs())
                }
            };

            let value = match apply(client)? {
                Some(value) => value,
                None => {
                    client.add(physical, b"0", exptime)?;
                    apply(client)?.ok_or_else(|| {
                        CacheError::Storage(format!("Counter '{}' vanished", physical))
                    })?
                }
            };

            match expiry {
                Expiry::Past => client.delete(physical)?,
                Expiry::At(exptime) if exptime > 0 => client.touch(physical, exptime)?,
                Expiry::At(_) => {}
            }
            Ok(i64::try_from(value).unwrap_or(i64::MAX))
        })
    }
}

impl<C: MemcachedClient> AtomicOperation for MemcachedEngine<C> {
    fn increment(&self, key: &str, by: i64, ttl: Option<Ttl>) -> Result<i64> {
        self.counter(key, by, ttl)
    }

    /// Memcached never goes below zero.
    fn decrement(&self, key: &str, by: i64, ttl: Option<Ttl>) -> Result<i64> {
        self.counter(key, by.saturating_neg(), ttl)
    }

    /// With an already expired TTL the list is built, then removed.
    fn add(&self, key: &str, value: Value, ttl: Option<Ttl>) -> Result<Vec<Value>> {
        let expiry = expiry(ttl);
        let exptime = match expiry {
            Expiry::At(exptime) => exptime,
            Expiry::Past => 0,
        };

        self.with_key(key, |client, physical| {
            for attempt in 1..=MAX_CAS_ATTEMPTS {
                let stored = match client.gets(physical)? {
                    Some((bytes, token)) => {
                        let list = append_to_list(Some(decode_lenient(&bytes)), value.clone());
                        let bytes = encode(&Value::Array(list.clone()))?;
                        client.cas(physical, &bytes, exptime, token)?.then_some(list)
                    }
                    None => {
                        let list = append_to_list(None, value.clone());
                        let bytes = encode(&Value::Array(list.clone()))?;
                        client.add(physical, &bytes, exptime)?.then_some(list)
                    }
                };

                if let Some(list) = stored {
                    if let Expiry::Past = expiry {
                        client.delete(physical)?;
                    }
                    return Ok(list);
                }
                debug!("[Memcached cache] Conflict on '{}', attempt {}", physical, attempt);
            }

            Err(CacheError::Storage(format!(
                "Gave up appending to '{}' after {} attempts",
                physical, MAX_CAS_ATTEMPTS
            )))
        })
    }
}

impl<C: MemcachedClient + 'static> From<MemcachedEngine<C>> for Engine {
    fn from(engine: MemcachedEngine<C>) -> Self {
        let engine = Arc::new(engine);
        Engine::new(engine.clone()).with_atomic(engine)
    }
}

// == Memcache Crate Adapter ==
#[cfg(feature = "memcached")]
mod client {
    use std::collections::HashMap;

    use memcache::MemcacheError;

    use super::MemcachedClient;
    use crate::engine::lazy::Connector;
    use crate::error::{CacheError, Result};

    /// Transport failures become `Io` so the connector reconnects.
    fn storage(e: MemcacheError) -> CacheError {
        match e {
            MemcacheError::IOError(e) => CacheError::Io(e),
            e => CacheError::Storage(e.to_string()),
        }
    }

    /// Lazily connects to the `host:port` servers.
    pub fn memcache_connector(servers: Vec<String>) -> Connector<memcache::Client> {
        Connector::new("Memcached", move || {
            let urls: Vec<String> = servers
                .iter()
                .map(|server| format!("memcache://{}", server))
                .collect();
            let mut client = memcache::Client::connect(urls).map_err(storage)?;
            MemcachedClient::handshake(&mut client)?;
            Ok(client)
        })
    }

    /// `Ok(false)` for a refused conditional store, the error otherwise.
    fn refused(result: std::result::Result<(), MemcacheError>) -> Result<bool> {
        match result {
            Ok(()) => Ok(true),
            Err(MemcacheError::CommandError(_)) => Ok(false),
            Err(e) => Err(storage(e)),
        }
    }

    fn absent(result: std::result::Result<u64, MemcacheError>) -> Result<Option<u64>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(MemcacheError::CommandError(_)) => Ok(None),
            Err(e) => Err(storage(e)),
        }
    }

    impl MemcachedClient for memcache::Client {
        fn handshake(&mut self) -> Result<()> {
            self.version().map_err(storage)?;
            Ok(())
        }

        fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
            memcache::Client::get(self, key).map_err(storage)
        }

        fn gets(&mut self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
            let mut found: HashMap<String, (Vec<u8>, u32, Option<u64>)> =
                memcache::Client::gets(self, &[key]).map_err(storage)?;
            Ok(found
                .remove(key)
                .map(|(bytes, _flags, token)| (bytes, token.unwrap_or_default())))
        }

        fn set(&mut self, key: &str, value: &[u8], exptime: u32) -> Result<()> {
            memcache::Client::set(self, key, value, exptime).map_err(storage)
        }

        fn add(&mut self, key: &str, value: &[u8], exptime: u32) -> Result<bool> {
            refused(memcache::Client::add(self, key, value, exptime))
        }

        fn cas(&mut self, key: &str, value: &[u8], exptime: u32, token: u64) -> Result<bool> {
            match memcache::Client::cas(self, key, value, exptime, token) {
                Ok(stored) => Ok(stored),
                Err(MemcacheError::CommandError(_)) => Ok(false),
                Err(e) => Err(storage(e)),
            }
        }

        fn delete(&mut self, key: &str) -> Result<()> {
            memcache::Client::delete(self, key).map_err(storage)?;
            Ok(())
        }

        fn increment(&mut self, key: &str, by: u64) -> Result<Option<u64>> {
            absent(memcache::Client::increment(self, key, by))
        }

        fn decrement(&mut self, key: &str, by: u64) -> Result<Option<u64>> {
            absent(memcache::Client::decrement(self, key, by))
        }

        fn touch(&mut self, key: &str, exptime: u32) -> Result<()> {
            memcache::Client::touch(self, key, exptime).map_err(storage)?;
            Ok(())
        }
    }
}

#[cfg(feature = "memcached")]
pub use client::memcache_connector;
