//! Pool Statistics Module
//!
//! Counters describing how a pool's lookups were served.

use serde::Serialize;

// == Pool Stats ==
/// Tracks pool performance metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Lookups that found a value, in the buffer or the backend
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Hits answered from the buffer without touching the backend
    pub buffer_hits: u64,
    /// Items dropped from the buffer to respect its capacity
    pub evictions: u64,
    /// Items persisted to the backend
    pub saves: u64,
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Returns hits / (hits + misses), or 0.0 if no lookups have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_buffer_hit(&mut self) {
        self.hits += 1;
        self.buffer_hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_evictions(&mut self, count: usize) {
        self.evictions += count as u64;
    }

    pub fn record_save(&mut self) {
        self.saves += 1;
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_no_requests() {
        assert_eq!(PoolStats::new().hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_mixed() {
        let mut stats = PoolStats::new();
        stats.record_hit();
        stats.record_buffer_hit();
        stats.record_miss();
        stats.record_miss();

        assert_eq!(stats.hit_rate(), 0.5);
        assert_eq!(stats.buffer_hits, 1);
    }

    #[test]
    fn test_record_evictions_and_saves() {
        let mut stats = PoolStats::new();
        stats.record_evictions(2);
        stats.record_evictions(0);
        stats.record_save();

        assert_eq!(stats.evictions, 2);
        assert_eq!(stats.saves, 1);
    }
}
