//! Shared Engine Behavior
//!
//! TTL arithmetic and key remapping used by every engine before it touches
//! physical storage.

use std::collections::HashMap;
use std::fmt;

use chrono::Utc;

use crate::error::{CacheError, Result};

// == Time To Live ==
/// A time-to-live, either a plain count of seconds or a semantic duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Plain seconds count
    Seconds(i64),
    /// Semantic duration (days, hours, minutes, seconds)
    Interval(chrono::Duration),
}

impl Ttl {
    /// Shorthand for `Ttl::Seconds`.
    pub fn seconds(seconds: i64) -> Self {
        Ttl::Seconds(seconds)
    }

    /// Total seconds represented by this TTL.
    ///
    /// For an interval this is `days*86400 + hours*3600 + minutes*60 + seconds`.
    pub fn as_seconds(&self) -> i64 {
        match self {
            Ttl::Seconds(seconds) => *seconds,
            Ttl::Interval(duration) => duration.num_seconds(),
        }
    }

    /// A zero TTL means "use the engine default".
    pub fn is_zero(&self) -> bool {
        self.as_seconds() == 0
    }
}

impl From<i64> for Ttl {
    fn from(seconds: i64) -> Self {
        Ttl::Seconds(seconds)
    }
}

impl From<chrono::Duration> for Ttl {
    fn from(duration: chrono::Duration) -> Self {
        Ttl::Interval(duration)
    }
}

impl From<std::time::Duration> for Ttl {
    fn from(duration: std::time::Duration) -> Self {
        Ttl::Seconds(i64::try_from(duration.as_secs()).unwrap_or(i64::MAX))
    }
}

// == Clock ==
/// Current Unix timestamp in seconds.
pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}

// == Add To Now ==
/// Converts a TTL into an absolute expiration instant (Unix seconds).
///
/// Returns `None` when no TTL is given or the TTL is zero, meaning the
/// entry uses the engine default (no expiry). Negative TTLs produce an
/// instant in the past, so the entry is born expired.
pub fn add_to_now(ttl: Option<Ttl>) -> Option<i64> {
    match ttl {
        Some(ttl) if !ttl.is_zero() => Some(now_timestamp().saturating_add(ttl.as_seconds())),
        _ => None,
    }
}

// == Convert To Seconds ==
/// Converts a TTL into a relative seconds count for engines whose native
/// API wants seconds. Zero and absent both map to `None`.
pub fn convert_to_seconds(ttl: Option<Ttl>) -> Option<i64> {
    match ttl {
        Some(ttl) if !ttl.is_zero() => Some(ttl.as_seconds()),
        _ => None,
    }
}

// == Key Resolver ==
/// Resolves a logical cache key to the physical key actually stored.
pub trait KeyResolver: Send + Sync {
    /// Whether the resolver knows the key.
    fn has(&self, key: &str) -> bool;

    /// The physical key for `key`, if known.
    fn get(&self, key: &str) -> Option<String>;
}

/// Applies the optional key remap.
///
/// Without a resolver the key passes through unchanged. With one, an
/// unknown key is an `InvalidArgument` error rather than a silent fallback.
pub fn resolve_key(resolver: Option<&dyn KeyResolver>, key: &str) -> Result<String> {
    let Some(resolver) = resolver else {
        return Ok(key.to_string());
    };

    if !resolver.has(key) {
        return Err(CacheError::InvalidArgument(format!(
            "Key '{}' not found in container",
            key
        )));
    }

    resolver.get(key).ok_or_else(|| {
        CacheError::InvalidArgument(format!("Key '{}' could not be resolved", key))
    })
}

/// A fixed logical-to-physical key table.
#[derive(Default, Clone)]
pub struct StaticKeyResolver {
    keys: HashMap<String, String>,
}

impl StaticKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mapping and returns the resolver for chaining.
    pub fn with(mut self, key: impl Into<String>, physical: impl Into<String>) -> Self {
        self.keys.insert(key.into(), physical.into());
        self
    }
}

impl KeyResolver for StaticKeyResolver {
    fn has(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    fn get(&self, key: &str) -> Option<String> {
        self.keys.get(key).cloned()
    }
}

impl fmt::Debug for StaticKeyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeyResolver")
            .field("keys", &self.keys.len())
            .finish()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_interval_to_seconds() {
        let interval = chrono::Duration::days(1)
            + chrono::Duration::hours(2)
            + chrono::Duration::minutes(3)
            + chrono::Duration::seconds(4);

        assert_eq!(
            convert_to_seconds(Some(Ttl::Interval(interval))),
            Some(86400 + 2 * 3600 + 3 * 60 + 4)
        );
    }

    #[test]
    fn test_convert_seconds_passthrough() {
        assert_eq!(convert_to_seconds(Some(Ttl::Seconds(42))), Some(42));
        assert_eq!(convert_to_seconds(None), None);
        assert_eq!(convert_to_seconds(Some(Ttl::Seconds(0))), None);
    }

    #[test]
    fn test_add_to_now() {
        let before = now_timestamp();
        let expires = add_to_now(Some(Ttl::Seconds(10))).unwrap();
        let after = now_timestamp();

        assert!(expires >= before + 10);
        assert!(expires <= after + 10);
    }

    #[test]
    fn test_add_to_now_zero_means_default() {
        assert_eq!(add_to_now(Some(Ttl::Seconds(0))), None);
        assert_eq!(add_to_now(None), None);
    }

    #[test]
    fn test_add_to_now_negative_is_past() {
        let expires = add_to_now(Some(Ttl::Seconds(-5))).unwrap();
        assert!(expires < now_timestamp());
    }

    #[test]
    fn test_ttl_from_std_duration() {
        let ttl: Ttl = std::time::Duration::from_secs(90).into();
        assert_eq!(ttl, Ttl::Seconds(90));
    }

    #[test]
    fn test_resolve_without_resolver() {
        assert_eq!(resolve_key(None, "chave").unwrap(), "chave");
    }

    #[test]
    fn test_resolve_with_resolver() {
        let resolver = StaticKeyResolver::new().with("chave", "physical-key");

        assert_eq!(
            resolve_key(Some(&resolver), "chave").unwrap(),
            "physical-key"
        );

        let err = resolve_key(Some(&resolver), "unknown").unwrap_err();
        assert!(err.is_invalid_argument());
    }
}
