//! Engine Factory
//!
//! Builds engine bundles and pools from engine definitions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::EngineConfig;
use crate::engine::{
    AdvisoryLock, ArrayCacheEngine, Engine, FileSystemCacheEngine, NoCacheEngine, SentinelFileLock,
    Session, SessionCacheEngine, DEFAULT_POLL_INTERVAL,
};
#[cfg(target_os = "linux")]
use crate::engine::{ShmopCacheEngine, ShmopConfig};
use crate::error::{CacheError, Result};
use crate::pool::{CachePool, DEFAULT_BUFFER_SIZE};

fn lock_strategy(timeout_secs: u64) -> Arc<dyn AdvisoryLock> {
    Arc::new(SentinelFileLock::new(
        Duration::from_secs(timeout_secs),
        DEFAULT_POLL_INTERVAL,
    ))
}

// == Factory ==
/// Entry points for building engines and pools.
pub struct Factory;

impl Factory {
    // == Create Engine ==
    /// Builds the engine described by `config` with all its capabilities.
    ///
    /// Remote engines do not connect here; the first operation does.
    pub fn create_engine(config: &EngineConfig) -> Result<Engine> {
        info!("Creating '{}' cache engine", config.kind());

        match config {
            EngineConfig::Null => Ok(NoCacheEngine::new().into()),
            EngineConfig::Array => Ok(ArrayCacheEngine::new().into()),
            EngineConfig::Filesystem {
                prefix,
                path,
                create_path,
                lock_timeout_secs,
            } => Ok(FileSystemCacheEngine::new(prefix.clone(), path.clone(), *create_path)?
                .with_lock_strategy(lock_strategy(*lock_timeout_secs))
                .into()),
            EngineConfig::Tmpfs { lock_timeout_secs } => Ok(FileSystemCacheEngine::tmpfs()?
                .with_lock_strategy(lock_strategy(*lock_timeout_secs))
                .into()),
            EngineConfig::Shmop {
                max_size,
                default_permission,
                path,
            } => Self::shmop_engine(*max_size, default_permission, path.clone()),
            EngineConfig::Session { prefix } => {
                Ok(SessionCacheEngine::new(Session::new(), prefix.clone()).into())
            }
            EngineConfig::Memcached { servers } => Self::memcached_engine(servers),
            EngineConfig::Redis { server, password } => Self::redis_engine(server, password),
        }
    }

    #[cfg(target_os = "linux")]
    fn shmop_engine(max_size: usize, permission: &str, path: Option<PathBuf>) -> Result<Engine> {
        let defaults = ShmopConfig::default();
        let config = ShmopConfig {
            max_size,
            default_permission: permission.to_string(),
            path: path.unwrap_or(defaults.path),
        };
        Ok(ShmopCacheEngine::new(config)?.into())
    }

    #[cfg(not(target_os = "linux"))]
    fn shmop_engine(_max_size: usize, _permission: &str, _path: Option<PathBuf>) -> Result<Engine> {
        Err(CacheError::Config(
            "The shmop engine is only available on Linux".to_string(),
        ))
    }

    #[cfg(feature = "memcached")]
    fn memcached_engine(servers: &[String]) -> Result<Engine> {
        use crate::engine::{memcache_connector, MemcachedEngine};

        Ok(MemcachedEngine::new(memcache_connector(servers.to_vec())).into())
    }

    #[cfg(not(feature = "memcached"))]
    fn memcached_engine(_servers: &[String]) -> Result<Engine> {
        Err(CacheError::Config(
            "The memcached engine requires the `memcached` feature".to_string(),
        ))
    }

    #[cfg(feature = "redis")]
    fn redis_engine(server: &str, password: &Option<String>) -> Result<Engine> {
        use crate::engine::{redis_connector, RedisCacheEngine};

        Ok(RedisCacheEngine::new(redis_connector(server.to_string(), password.clone())).into())
    }

    #[cfg(not(feature = "redis"))]
    fn redis_engine(_server: &str, _password: &Option<String>) -> Result<Engine> {
        Err(CacheError::Config(
            "The redis engine requires the `redis` feature".to_string(),
        ))
    }

    // == Create Pool ==
    /// Builds a pool over the engine described by `config`.
    pub fn create_pool(config: &EngineConfig, buffer_size: usize) -> Result<CachePool> {
        let engine = Self::create_engine(config)?;
        Ok(CachePool::with_buffer_size(engine.basic(), buffer_size))
    }

    pub fn create_null_pool() -> CachePool {
        CachePool::new(Arc::new(NoCacheEngine::new()))
    }

    pub fn create_array_pool() -> CachePool {
        CachePool::new(Arc::new(ArrayCacheEngine::new()))
    }

    /// Pool over a filesystem engine; `path` defaults to the system temp dir.
    pub fn create_file_pool(prefix: &str, path: Option<PathBuf>) -> Result<CachePool> {
        let engine = FileSystemCacheEngine::new(prefix, path, false)?;
        Ok(CachePool::new(Arc::new(engine)))
    }

    /// Pool over a session the caller keeps a handle to.
    pub fn create_session_pool(session: Session, prefix: &str) -> CachePool {
        CachePool::new(Arc::new(SessionCacheEngine::new(session, prefix)))
    }

    #[cfg(target_os = "linux")]
    pub fn create_shmop_pool(config: ShmopConfig) -> Result<CachePool> {
        Ok(CachePool::new(Arc::new(ShmopCacheEngine::new(config)?)))
    }

    pub fn create_memcached_pool(servers: Vec<String>) -> Result<CachePool> {
        Self::create_pool(&EngineConfig::Memcached { servers }, DEFAULT_BUFFER_SIZE)
    }

    pub fn create_redis_pool(server: &str, password: Option<String>) -> Result<CachePool> {
        let config = EngineConfig::Redis {
            server: server.to_string(),
            password,
        };
        Self::create_pool(&config, DEFAULT_BUFFER_SIZE)
    }
}
