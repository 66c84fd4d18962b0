//! Polycache - A uniform cache layer over interchangeable backends
//!
//! One key/value contract implemented by in-process, filesystem, shared
//! memory, session, memcached and redis engines, with an item pool on top.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod factory;
pub mod pool;
pub mod tasks;

pub use config::{CacheConfig, Config, EngineConfig};
pub use context::CacheContext;
pub use engine::{CacheEngine, CacheEngineExt, Engine, Ttl};
pub use error::{CacheError, Result};
pub use factory::Factory;
pub use pool::{CacheItem, CachePool, CommitReport};
pub use serde_json::Value;
pub use tasks::spawn_gc_task;
