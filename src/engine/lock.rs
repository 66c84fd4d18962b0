//! Advisory Lock Module
//!
//! Cooperative write locks expressed as a `.lock` sidecar file next to the
//! storage file of a key. Only compliant engines respect the marker; the OS
//! does not enforce it.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tracing::{info, warn};

use crate::error::Result;

// == Constants ==
/// How long a reader waits on a held lock before forcing it open
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(20);

/// Sleep between two checks of a held lock
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

// == Lock Wait Outcome ==
/// Result of waiting on a key's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// No lock was held
    Unlocked,
    /// The holder released the lock while we waited
    Released,
    /// The wait timed out and the lock was forcibly cleared
    TimedOut,
}

// == Advisory Lock Trait ==
/// A cooperative lock keyed by the storage path of a cache entry.
pub trait AdvisoryLock: Send + Sync + fmt::Debug {
    /// Marks `target` as write-locked.
    fn acquire(&self, target: &Path) -> Result<()>;

    /// Clears the lock on `target`. Releasing an unlocked target succeeds.
    fn release(&self, target: &Path) -> Result<()>;

    /// Whether `target` is currently locked.
    fn is_locked(&self, target: &Path) -> bool;

    /// Blocks until `target` is unlocked or the wait times out.
    fn wait_until_released(&self, target: &Path) -> LockWait;
}

// == Sentinel File Lock ==
/// Lock held as a `<target>.lock` file containing its creation timestamp.
///
/// The lock age is read from the sentinel's modification time.
#[derive(Debug, Clone)]
pub struct SentinelFileLock {
    timeout: Duration,
    poll_interval: Duration,
}

impl SentinelFileLock {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }

    /// Path of the sentinel file guarding `target`.
    pub fn sentinel_path(target: &Path) -> PathBuf {
        let mut path = target.as_os_str().to_owned();
        path.push(".lock");
        PathBuf::from(path)
    }

    /// Configured wait timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for SentinelFileLock {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT, DEFAULT_POLL_INTERVAL)
    }
}

impl AdvisoryLock for SentinelFileLock {
    fn acquire(&self, target: &Path) -> Result<()> {
        fs::write(Self::sentinel_path(target), Utc::now().to_rfc3339())?;
        Ok(())
    }

    fn release(&self, target: &Path) -> Result<()> {
        match fs::remove_file(Self::sentinel_path(target)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_locked(&self, target: &Path) -> bool {
        Self::sentinel_path(target).exists()
    }

    fn wait_until_released(&self, target: &Path) -> LockWait {
        let sentinel = Self::sentinel_path(target);
        let Ok(metadata) = fs::metadata(&sentinel) else {
            return LockWait::Unlocked;
        };
        let locked_at = metadata.modified().unwrap_or_else(|_| SystemTime::now());

        info!("Locked! {}. Waiting...", target.display());

        loop {
            if !sentinel.exists() {
                info!("Lock released for '{}'", target.display());
                return LockWait::Released;
            }

            let waited = SystemTime::now()
                .duration_since(locked_at)
                .unwrap_or_default();
            if waited > self.timeout {
                warn!(
                    "Gave up waiting for unlock after {:?}. Releasing lock for '{}'",
                    waited,
                    target.display()
                );
                if let Err(e) = self.release(target) {
                    warn!("Failed to force release of '{}': {}", target.display(), e);
                }
                return LockWait::TimedOut;
            }

            thread::sleep(self.poll_interval);
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn fast_lock() -> SentinelFileLock {
        SentinelFileLock::new(Duration::from_millis(300), Duration::from_millis(50))
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cache-key.cache");
        let lock = fast_lock();

        assert!(!lock.is_locked(&target));
        lock.acquire(&target).unwrap();
        assert!(lock.is_locked(&target));
        assert!(SentinelFileLock::sentinel_path(&target).exists());

        lock.release(&target).unwrap();
        assert!(!lock.is_locked(&target));

        // Releasing twice is fine
        lock.release(&target).unwrap();
    }

    #[test]
    fn test_wait_unlocked_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("free.cache");

        assert_eq!(fast_lock().wait_until_released(&target), LockWait::Unlocked);
    }

    #[test]
    fn test_wait_times_out_and_forces_release() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("stuck.cache");
        let lock = fast_lock();
        lock.acquire(&target).unwrap();

        let started = Instant::now();
        assert_eq!(lock.wait_until_released(&target), LockWait::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(!lock.is_locked(&target));
    }

    #[test]
    fn test_wait_sees_release_from_other_thread() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("busy.cache");
        let lock = SentinelFileLock::new(Duration::from_secs(5), Duration::from_millis(20));
        lock.acquire(&target).unwrap();

        let releaser = {
            let lock = lock.clone();
            let target = target.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                lock.release(&target).unwrap();
            })
        };

        assert_eq!(lock.wait_until_released(&target), LockWait::Released);
        releaser.join().unwrap();
    }
}
