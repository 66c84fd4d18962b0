//! Cache Item Module
//!
//! The object handed out by a pool: a key, its value, whether the lookup hit,
//! and an absolute expiration.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::engine::{add_to_now, Ttl};
use crate::error::Result;

/// Years an item lives when no expiration is set
const DEFAULT_LIFETIME_YEARS: i64 = 99;

/// Seconds-to-live at or below which a buffered item is refetched
const STALE_THRESHOLD_SECS: i64 = 1;

fn default_expiration() -> DateTime<Utc> {
    Utc::now() + Duration::days(365 * DEFAULT_LIFETIME_YEARS)
}

// == Cache Item ==
/// A cached value as seen through a pool.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheItem {
    key: String,
    value: Option<Value>,
    hit: bool,
    expiration: DateTime<Utc>,
}

impl CacheItem {
    // == Constructor ==
    /// Creates an empty item that has not been found in the cache.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            hit: false,
            expiration: default_expiration(),
        }
    }

    /// Builds the item for a backend lookup result. A null value is a miss.
    pub(crate) fn from_lookup(key: impl Into<String>, value: Option<Value>) -> Self {
        let value = value.filter(|v| !v.is_null());
        Self {
            hit: value.is_some(),
            value,
            ..Self::new(key)
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The value, or `None` unless the item is a hit.
    pub fn get(&self) -> Option<&Value> {
        if self.hit {
            self.value.as_ref()
        } else {
            None
        }
    }

    /// Deserializes the value into `T`.
    pub fn get_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.get() {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Replaces the value. Setting null turns the item into a miss.
    pub fn set(&mut self, value: Value) -> &mut Self {
        self.hit = !value.is_null();
        self.value = if self.hit { Some(value) } else { None };
        self
    }

    /// Serializes `value` into the item.
    pub fn set_as<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<&mut Self> {
        Ok(self.set(serde_json::to_value(value)?))
    }

    /// Whether the item was found, or has since been given a value.
    pub fn is_hit(&self) -> bool {
        self.hit
    }

    // == Expiration ==
    /// Expires at `when`, or at the default lifetime for `None`.
    pub fn expires_at(&mut self, when: Option<DateTime<Utc>>) -> &mut Self {
        self.expiration = when.unwrap_or_else(default_expiration);
        self
    }

    /// Expires `ttl` from now. `None` or a zero TTL means the default lifetime.
    pub fn expires_after(&mut self, ttl: Option<Ttl>) -> &mut Self {
        self.expiration = add_to_now(ttl)
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(default_expiration);
        self
    }

    pub fn expiration(&self) -> DateTime<Utc> {
        self.expiration
    }

    /// Whole seconds left before expiration. Negative once expired.
    pub fn expires_in_secs(&self) -> i64 {
        (self.expiration - Utc::now()).num_seconds()
    }

    /// A buffered copy this close to expiry is not served.
    pub fn is_stale(&self) -> bool {
        self.expires_in_secs() <= STALE_THRESHOLD_SECS
    }
}
