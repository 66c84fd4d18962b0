//! No-Cache Engine
//!
//! Accepts every write and never returns anything. Used to switch caching
//! off without touching call sites.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::base::Ttl;
use super::{CacheEngine, CacheLock, Engine};
use crate::error::Result;

/// Engine that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCacheEngine;

impl NoCacheEngine {
    pub fn new() -> Self {
        Self
    }
}

impl CacheEngine for NoCacheEngine {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        debug!("[No cache] Not found '{}'", key);
        Ok(None)
    }

    fn set(&self, _key: &str, _value: Value, _ttl: Option<Ttl>) -> Result<bool> {
        Ok(true)
    }

    fn delete(&self, _key: &str) -> Result<bool> {
        Ok(true)
    }

    fn has(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }

    fn clear(&self) -> Result<bool> {
        Ok(true)
    }

    fn is_available(&self) -> bool {
        true
    }
}

impl CacheLock for NoCacheEngine {
    fn lock(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    fn unlock(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

impl From<NoCacheEngine> for Engine {
    fn from(engine: NoCacheEngine) -> Self {
        let engine = Arc::new(engine);
        Engine::new(engine.clone()).with_locking(engine)
    }
}
