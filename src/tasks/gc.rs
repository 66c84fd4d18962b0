//! Garbage Collection Task
//!
//! Background task that periodically purges expired entries from an engine
//! with the garbage collecting capability.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::engine::GarbageCollector;

/// Spawns a background task that calls `collect_garbage` every interval.
///
/// Collection does blocking I/O, so each sweep runs on the blocking pool.
///
/// # Arguments
/// * `collector` - Engine to sweep
/// * `interval_secs` - Interval in seconds between sweeps
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during graceful shutdown.
pub fn spawn_gc_task(collector: Arc<dyn GarbageCollector>, interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(interval_secs);

    tokio::spawn(async move {
        info!(
            "Starting garbage collection task with interval of {} seconds",
            interval_secs
        );

        loop {
            tokio::time::sleep(interval).await;

            let collector = Arc::clone(&collector);
            let result = tokio::task::spawn_blocking(move || collector.collect_garbage()).await;

            match result {
                Ok(Ok(removed)) if removed > 0 => {
                    info!("Garbage collection: removed {} expired entries", removed);
                }
                Ok(Ok(_)) => debug!("Garbage collection: no expired entries found"),
                Ok(Err(e)) => error!("Garbage collection failed: {}", e),
                Err(e) => error!("Garbage collection task panicked: {}", e),
            }
        }
    })
}
