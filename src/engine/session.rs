//! Session Cache Engine
//!
//! Caches inside a request/session scoped associative store. The store is a
//! cheap clonable [`Session`] handle the host application owns; the engine
//! only namespaces its keys with a prefix.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use super::base::{add_to_now, now_timestamp, resolve_key, KeyResolver, Ttl};
use super::{CacheEngine, Engine};
use crate::error::Result;

// == Session Store ==
/// Shared session storage. Clones point at the same data.
#[derive(Debug, Clone)]
pub struct Session {
    data: Arc<Mutex<HashMap<String, Value>>>,
    active: Arc<AtomicBool>,
}

impl Session {
    /// Creates an active, empty session.
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.lock().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.data.lock().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.data.lock().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.lock().contains_key(key)
    }

    /// Drops every key starting with `prefix`.
    pub fn remove_prefixed(&self, prefix: &str) {
        self.data.lock().retain(|key, _| !key.starts_with(prefix));
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    /// Whether the session is open for use.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Ends the session; engines bound to it report unavailable.
    pub fn close(&self) {
        self.active.store(false, Ordering::Release);
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

// == Session Cache Engine ==
/// Engine over a [`Session`], keys stored as `<prefix>-<key>`.
pub struct SessionCacheEngine {
    session: Session,
    prefix: String,
    resolver: Option<Arc<dyn KeyResolver>>,
}

impl SessionCacheEngine {
    pub fn new(session: Session, prefix: impl Into<String>) -> Self {
        Self {
            session,
            prefix: prefix.into(),
            resolver: None,
        }
    }

    /// Routes every key through `resolver` before touching storage.
    pub fn with_key_resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn fix_key(&self, key: &str) -> Result<String> {
        let key = resolve_key(self.resolver.as_deref(), key)?;
        Ok(format!("{}-{}", self.prefix, key))
    }

    fn ttl_key(session_key: &str) -> String {
        format!("{}.ttl", session_key)
    }

    fn remove(&self, session_key: &str) {
        self.session.remove(session_key);
        self.session.remove(&Self::ttl_key(session_key));
    }

    /// Lazy expiry check on an already prefixed key.
    fn is_alive(&self, session_key: &str) -> bool {
        if !self.session.contains(session_key) {
            return false;
        }

        let expires = self
            .session
            .get(&Self::ttl_key(session_key))
            .and_then(|ttl| ttl.as_i64());
        if let Some(expires) = expires {
            if now_timestamp() >= expires {
                debug!("[Session cache] Expired '{}'", session_key);
                self.remove(session_key);
                return false;
            }
        }

        true
    }
}

impl CacheEngine for SessionCacheEngine {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let session_key = self.fix_key(key)?;
        if !self.is_alive(&session_key) {
            return Ok(None);
        }

        debug!("[Session cache] Get '{}'", key);
        Ok(self.session.get(&session_key))
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Ttl>) -> Result<bool> {
        let session_key = self.fix_key(key)?;
        if value.is_null() {
            self.remove(&session_key);
            return Ok(true);
        }

        debug!("[Session cache] Set '{}'", key);

        let ttl_key = Self::ttl_key(&session_key);
        match add_to_now(ttl) {
            Some(expires) => self.session.insert(ttl_key, Value::from(expires)),
            None => {
                self.session.remove(&ttl_key);
            }
        }
        self.session.insert(session_key, value);
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let session_key = self.fix_key(key)?;
        self.remove(&session_key);
        Ok(true)
    }

    fn has(&self, key: &str) -> Result<bool> {
        let session_key = self.fix_key(key)?;
        Ok(self.is_alive(&session_key))
    }

    fn clear(&self) -> Result<bool> {
        self.session.remove_prefixed(&format!("{}-", self.prefix));
        Ok(true)
    }

    fn is_available(&self) -> bool {
        self.session.is_active()
    }
}

impl From<SessionCacheEngine> for Engine {
    fn from(engine: SessionCacheEngine) -> Self {
        Engine::new(Arc::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_are_prefixed() {
        let session = Session::new();
        let engine = SessionCacheEngine::new(session.clone(), "cache");

        engine.set("chave", json!("valor"), Some(Ttl::Seconds(60))).unwrap();

        assert_eq!(session.get("cache-chave"), Some(json!("valor")));
        assert!(session.get("cache-chave.ttl").unwrap().as_i64().is_some());
        assert_eq!(engine.get("chave").unwrap(), Some(json!("valor")));
    }

    #[test]
    fn test_expired_entry_is_removed() {
        let session = Session::new();
        let engine = SessionCacheEngine::new(session.clone(), "cache");

        engine.set("old", json!(1), Some(Ttl::Seconds(-1))).unwrap();
        assert!(!engine.has("old").unwrap());
        assert!(session.is_empty());
    }

    #[test]
    fn test_set_without_ttl_drops_previous_expiry() {
        let session = Session::new();
        let engine = SessionCacheEngine::new(session.clone(), "cache");

        engine.set("k", json!(1), Some(Ttl::Seconds(-1))).unwrap();
        engine.set("k", json!(2), None).unwrap();

        assert_eq!(engine.get("k").unwrap(), Some(json!(2)));
        assert!(!session.contains("cache-k.ttl"));
    }

    #[test]
    fn test_clear_keeps_foreign_keys() {
        let session = Session::new();
        session.insert("user_id", json!(42));
        let engine = SessionCacheEngine::new(session.clone(), "cache");

        engine.set("a", json!(1), Some(Ttl::Seconds(60))).unwrap();
        engine.clear().unwrap();

        assert_eq!(session.len(), 1);
        assert_eq!(session.get("user_id"), Some(json!(42)));
    }

    #[test]
    fn test_null_value_is_absent() {
        let session = Session::new();
        let engine = SessionCacheEngine::new(session.clone(), "cache");

        engine.set("k", json!(1), Some(Ttl::Seconds(60))).unwrap();
        engine.set("k", Value::Null, None).unwrap();

        assert!(!engine.has("k").unwrap());
        assert_eq!(engine.get_or("k", json!("default")).unwrap(), json!("default"));
        assert!(session.is_empty());
    }

    #[test]
    fn test_closed_session_is_unavailable() {
        let session = Session::new();
        let engine = SessionCacheEngine::new(session.clone(), "cache");

        assert!(engine.is_available());
        session.close();
        assert!(!engine.is_available());
    }
}
