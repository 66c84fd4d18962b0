//! Cache Pool Module
//!
//! Object-level cache built on any engine: items with hit flags and
//! absolute expirations, a bounded lookup buffer and deferred saves.

mod buffer;
mod item;
mod stats;
mod store;


// Re-export public types
pub use buffer::ItemBuffer;
pub use item::CacheItem;
pub use stats::PoolStats;
pub use store::{CachePool, CommitReport};

// == Public Constants ==
/// Items a pool keeps in memory unless told otherwise
pub const DEFAULT_BUFFER_SIZE: usize = 10;
