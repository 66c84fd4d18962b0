//! Background Tasks Module
//!
//! Contains background tasks that run periodically while the daemon is up.
//!
//! # Tasks
//! - Garbage collection: purges expired entries at configured intervals

mod gc;

pub use gc::spawn_gc_task;
