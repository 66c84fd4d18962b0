//! Redis Cache Engine
//!
//! Talks to a Redis server through the [`RedisClient`] capability. Keys are
//! sent as `cache:<key>`. Values are stored as serialized strings, except
//! lists built by `add`, which use native Redis lists.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error};

use super::base::{convert_to_seconds, resolve_key, KeyResolver, Ttl};
use super::codec::{decode_lenient, encode};
use super::lazy::Connector;
use super::{append_to_list, AtomicOperation, CacheEngine, Engine, MAX_CAS_ATTEMPTS};
use crate::error::{CacheError, Result};

// == Constants ==
/// Server used when none is configured
pub const DEFAULT_SERVER: &str = "127.0.0.1:6379";

const KEY_PREFIX: &str = "cache:";

/// Native type stored at a Redis key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedisType {
    None,
    String,
    List,
    Other,
}

impl RedisType {
    /// Parses the reply of the `TYPE` command.
    pub fn from_reply(reply: &str) -> Self {
        match reply {
            "none" => RedisType::None,
            "string" => RedisType::String,
            "list" => RedisType::List,
            _ => RedisType::Other,
        }
    }
}

// == Client Capability ==
/// Commands the engine needs from a Redis connection.
pub trait RedisClient: Send {
    /// Checks the server answers `PING`.
    fn ping(&mut self) -> Result<()>;

    fn key_type(&mut self, key: &str) -> Result<RedisType>;

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>>;

    /// The whole list stored at `key`.
    fn lrange(&mut self, key: &str) -> Result<Vec<Vec<u8>>>;

    /// `SET`, with `EX` when `ttl_secs` is given.
    fn set(&mut self, key: &str, value: &[u8], ttl_secs: Option<i64>) -> Result<()>;

    fn del(&mut self, keys: &[String]) -> Result<()>;

    fn exists(&mut self, key: &str) -> Result<bool>;

    fn expire(&mut self, key: &str, secs: i64) -> Result<()>;

    fn incr_by(&mut self, key: &str, by: i64) -> Result<i64>;

    fn keys(&mut self, pattern: &str) -> Result<Vec<String>>;

    fn watch(&mut self, key: &str) -> Result<()>;

    fn unwatch(&mut self) -> Result<()>;

    /// Replaces `key` with a list inside `MULTI`/`EXEC`.
    ///
    /// Returns false when the transaction was aborted because a watched
    /// key changed.
    fn replace_list(&mut self, key: &str, items: &[Vec<u8>], ttl_secs: Option<i64>) -> Result<bool>;
}

// == Redis Cache Engine ==
pub struct RedisCacheEngine<C> {
    connector: Connector<C>,
    resolver: Option<Arc<dyn KeyResolver>>,
}

impl<C: RedisClient> RedisCacheEngine<C> {
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

    fn fix_key(&self, key: &str) -> Result<String> {
        let key = resolve_key(self.resolver.as_deref(), key)?;
        Ok(format!("{}{}", KEY_PREFIX, key))
    }
}

/// Reads a key honouring its native type.
fn read_typed<C: RedisClient>(client: &mut C, key: &str) -> Result<Option<Value>> {
    match client.key_type(key)? {
        RedisType::None => Ok(None),
        RedisType::List => {
            let items = client.lrange(key)?;
            Ok(Some(Value::Array(
                items.iter().map(|item| decode_lenient(item)).collect(),
            )))
        }
        _ => Ok(client.get(key)?.map(|bytes| decode_lenient(&bytes))),
    }
}

/// One optimistic append on a watched key. `None` when the transaction
/// was aborted by a concurrent write.
fn try_append<C: RedisClient>(
    client: &mut C,
    key: &str,
    value: &Value,
    ttl: Option<i64>,
) -> Result<Option<Vec<Value>>> {
    let list = append_to_list(read_typed(client, key)?, value.clone());
    let items = list.iter().map(encode).collect::<Result<Vec<_>>>()?;

    Ok(client.replace_list(key, &items, ttl)?.then_some(list))
}

/// TTL in seconds, `None` when the entry never expires.
fn ttl_seconds(ttl: Option<Ttl>) -> Option<i64> {
    convert_to_seconds(ttl).filter(|secs| *secs != 0)
}

impl<C: RedisClient> CacheEngine for RedisCacheEngine<C> {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let key = self.fix_key(key)?;
        debug!("[Redis cache] Get '{}'", key);
        self.connector.with(|client| read_typed(client, &key))
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Ttl>) -> Result<bool> {
        let key = self.fix_key(key)?;
        let bytes = encode(&value)?;
        debug!("[Redis cache] Set '{}'", key);

        self.connector
            .with(|client| match ttl_seconds(ttl) {
                Some(secs) if secs < 0 => client.del(&[key.clone()]),
                secs => client.set(&key, &bytes, secs),
            })
            .map_err(|e| {
                error!("[Redis cache] Could not set '{}': {}", key, e);
                e
            })?;
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let key = self.fix_key(key)?;
        self.connector.with(|client| client.del(&[key]))?;
        Ok(true)
    }

    fn has(&self, key: &str) -> Result<bool> {
        let key = self.fix_key(key)?;
        self.connector.with(|client| client.exists(&key))
    }

    fn clear(&self) -> Result<bool> {
        self.connector.with(|client| {
            let keys = client.keys(&format!("{}*", KEY_PREFIX))?;
            if !keys.is_empty() {
                client.del(&keys)?;
            }
            Ok(true)
        })
    }

    fn is_available(&self) -> bool {
        self.connector.with(|client| client.ping()).is_ok()
    }
}

impl<C: RedisClient> AtomicOperation for RedisCacheEngine<C> {
    fn increment(&self, key: &str, by: i64, ttl: Option<Ttl>) -> Result<i64> {
        let key = self.fix_key(key)?;
        self.connector.with(|client| {
            let value = client.incr_by(&key, by)?;
            if let Some(secs) = ttl_seconds(ttl) {
                client.expire(&key, secs)?;
            }
            Ok(value)
        })
    }

    fn decrement(&self, key: &str, by: i64, ttl: Option<Ttl>) -> Result<i64> {
        self.increment(key, -by, ttl)
    }

    fn add(&self, key: &str, value: Value, ttl: Option<Ttl>) -> Result<Vec<Value>> {
        let key = self.fix_key(key)?;
        let ttl = ttl_seconds(ttl);

        self.connector.with(|client| {
            for attempt in 1..=MAX_CAS_ATTEMPTS {
                client.watch(&key)?;

                match try_append(client, &key, &value, ttl) {
                    Ok(Some(list)) => return Ok(list),
                    Ok(None) => {
                        debug!("[Redis cache] Conflict on '{}', attempt {}", key, attempt)
                    }
                    Err(e) => {
                        let _ = client.unwatch();
                        return Err(e);
                    }
                }
            }

            Err(CacheError::Storage(format!(
                "Gave up appending to '{}' after {} attempts",
                key, MAX_CAS_ATTEMPTS
            )))
        })
    }
}

impl<C: RedisClient + 'static> From<RedisCacheEngine<C>> for Engine {
    fn from(engine: RedisCacheEngine<C>) -> Self {
        let engine = Arc::new(engine);
        Engine::new(engine.clone()).with_atomic(engine)
    }
}

// == Redis Crate Adapter ==
#[cfg(feature = "redis")]
mod client {
    use super::{RedisClient, RedisType};
    use crate::engine::lazy::Connector;
    use crate::error::{CacheError, Result};

    /// Transport failures become `Io` so the connector reconnects.
    fn storage(e: redis::RedisError) -> CacheError {
        if e.is_io_error() || e.is_connection_dropped() {
            CacheError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                e.to_string(),
            ))
        } else {
            CacheError::Storage(e.to_string())
        }
    }

    /// Lazily connects to `server` (`host:port`), authenticating when a
    /// password is given.
    pub fn redis_connector(server: String, password: Option<String>) -> Connector<redis::Connection> {
        Connector::new("Redis", move || {
            let url = match &password {
                Some(password) => format!("redis://:{}@{}/", password, server),
                None => format!("redis://{}/", server),
            };
            let client = redis::Client::open(url).map_err(storage)?;
            let mut connection = client.get_connection().map_err(storage)?;
            RedisClient::ping(&mut connection)?;
            Ok(connection)
        })
    }

    impl RedisClient for redis::Connection {
        fn ping(&mut self) -> Result<()> {
            redis::cmd("PING").query::<String>(self).map_err(storage)?;
            Ok(())
        }

        fn key_type(&mut self, key: &str) -> Result<RedisType> {
            let reply: String = redis::cmd("TYPE").arg(key).query(self).map_err(storage)?;
            Ok(RedisType::from_reply(&reply))
        }

        fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
            redis::cmd("GET").arg(key).query(self).map_err(storage)
        }

        fn lrange(&mut self, key: &str) -> Result<Vec<Vec<u8>>> {
            redis::cmd("LRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .query(self)
                .map_err(storage)
        }

        fn set(&mut self, key: &str, value: &[u8], ttl_secs: Option<i64>) -> Result<()> {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(secs) = ttl_secs {
                cmd.arg("EX").arg(secs);
            }
            cmd.query(self).map_err(storage)
        }

        fn del(&mut self, keys: &[String]) -> Result<()> {
            redis::cmd("DEL").arg(keys).query(self).map_err(storage)
        }

        fn exists(&mut self, key: &str) -> Result<bool> {
            redis::cmd("EXISTS").arg(key).query(self).map_err(storage)
        }

        fn expire(&mut self, key: &str, secs: i64) -> Result<()> {
            redis::cmd("EXPIRE").arg(key).arg(secs).query(self).map_err(storage)
        }

        fn incr_by(&mut self, key: &str, by: i64) -> Result<i64> {
            redis::cmd("INCRBY").arg(key).arg(by).query(self).map_err(storage)
        }

        fn keys(&mut self, pattern: &str) -> Result<Vec<String>> {
            redis::cmd("KEYS").arg(pattern).query(self).map_err(storage)
        }

        fn watch(&mut self, key: &str) -> Result<()> {
            redis::cmd("WATCH").arg(key).query(self).map_err(storage)
        }

        fn unwatch(&mut self) -> Result<()> {
            redis::cmd("UNWATCH").query(self).map_err(storage)
        }

        fn replace_list(&mut self, key: &str, items: &[Vec<u8>], ttl_secs: Option<i64>) -> Result<bool> {
            let mut pipe = redis::pipe();
            pipe.atomic().del(key).ignore().rpush(key, items).ignore();
            if let Some(secs) = ttl_secs {
                pipe.expire(key, secs).ignore();
            }
            let reply: Option<redis::Value> = pipe.query(self).map_err(storage)?;
            Ok(reply.is_some())
        }
    }
}

#[cfg(feature = "redis")]
pub use client::redis_connector;
