//! Cache Context Module
//!
//! Per-request switches that change how a pool talks to its backend.

use std::collections::HashMap;

// == Cache Context ==
/// Request-scoped cache flags, passed explicitly to each pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheContext {
    /// Ignore cached values and refresh them from the source
    pub reset: bool,
    /// Bypass the cache entirely
    pub no_cache: bool,
}

impl CacheContext {
    pub fn new(reset: bool, no_cache: bool) -> Self {
        Self { reset, no_cache }
    }

    /// Reads the `reset` and `nocache` request parameters.
    ///
    /// Only the value `true` (any case) enables a flag.
    pub fn from_params(params: &HashMap<String, String>) -> Self {
        let flag = |name: &str| {
            params
                .get(name)
                .map(|value| value.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };

        Self {
            reset: flag("reset"),
            no_cache: flag("nocache"),
        }
    }

    /// Reads must go to the source instead of the cache.
    pub fn skip_reads(&self) -> bool {
        self.reset || self.no_cache
    }

    /// Writes are dropped. A reset still writes the refreshed value back.
    pub fn skip_writes(&self) -> bool {
        self.no_cache && !self.reset
    }
}
