//! Stored Entry Module
//!
//! Defines the in-process representation of one cache entry with TTL support.

use serde_json::Value;

use super::base::now_timestamp;

// == Stored Entry ==
/// A value held by an in-process engine together with its expiry.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    /// The stored value
    pub value: Value,
    /// Creation timestamp (Unix seconds)
    pub created_at: i64,
    /// Expiration timestamp (Unix seconds), None = no expiration
    pub expires_at: Option<i64>,
}

impl StoredEntry {
    // == Constructor ==
    /// Creates a new entry with an optional absolute expiry.
    pub fn new(value: Value, expires_at: Option<i64>) -> Self {
        Self {
            value,
            created_at: now_timestamp(),
            expires_at,
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired.
    ///
    /// An entry is expired once the current time is greater than or equal
    /// to the expiration time.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_timestamp())
    }

    /// Expiration check against an explicit clock reading.
    pub fn is_expired_at(&self, now: i64) -> bool {
        match self.expires_at {
            Some(expires) => now >= expires,
            None => false,
        }
    }

    // == Time To Live ==
    /// Returns remaining TTL in seconds, or None if no expiration is set.
    pub fn ttl_remaining(&self) -> Option<i64> {
        self.expires_at
            .map(|expires| (expires - now_timestamp()).max(0))
    }
}
