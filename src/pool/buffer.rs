//! Item Buffer Module
//!
//! Bounded first-in first-out buffer of recently seen items, sitting in
//! front of the backend.

use std::collections::{HashMap, VecDeque};

use super::item::CacheItem;

// == Item Buffer ==
/// Keeps at most `capacity` items, dropping the oldest insertion first.
///
/// Keys are stored in a VecDeque where:
/// - Front = First inserted (next to be evicted)
/// - Back = Last inserted
///
/// Re-inserting a buffered key replaces the item but keeps its place.
#[derive(Debug)]
pub struct ItemBuffer {
    items: HashMap<String, CacheItem>,
    order: VecDeque<String>,
    capacity: usize,
}

impl ItemBuffer {
    // == Constructor ==
    /// Creates a buffer. A capacity of zero disables buffering.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // == Resize ==
    /// Changes the capacity, returning the keys evicted to fit.
    pub fn set_capacity(&mut self, capacity: usize) -> Vec<String> {
        self.capacity = capacity;
        let mut evicted = Vec::new();
        while self.order.len() > capacity {
            if let Some(key) = self.evict_oldest() {
                evicted.push(key);
            }
        }
        evicted
    }

    // == Insert ==
    /// Buffers an item and returns the key evicted to make room, if any.
    pub fn insert(&mut self, item: CacheItem) -> Option<String> {
        if self.capacity == 0 {
            return None;
        }

        let key = item.key().to_string();
        if self.items.insert(key.clone(), item).is_some() {
            return None;
        }

        self.order.push_back(key);
        if self.order.len() > self.capacity {
            return self.evict_oldest();
        }
        None
    }

    pub fn get(&self, key: &str) -> Option<&CacheItem> {
        self.items.get(key)
    }

    // == Remove ==
    pub fn remove(&mut self, key: &str) -> Option<CacheItem> {
        let item = self.items.remove(key)?;
        self.order.retain(|k| k != key);
        Some(item)
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let key = self.order.pop_front()?;
        self.items.remove(&key);
        Some(key)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.order.clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Buffered keys, oldest first.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}
