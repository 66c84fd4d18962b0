//! Shared Memory Cache Engine
//!
//! Stores each value in its own System V shared memory segment. A zero-byte
//! token file per key exists only to derive a stable segment id through
//! `ftok`; expiry uses the same `.ttl` sidecar as the filesystem engine.
//!
//! Segments are never resized: every `set` destroys and recreates the
//! segment, so a concurrent reader may briefly see a miss.

use std::ffi::CString;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::base::{add_to_now, now_timestamp, resolve_key, KeyResolver, Ttl};
use super::codec::{decode, encode};
use super::filesystem::{is_writable_dir, read_expiry, remove_if_exists, ttl_path};
use super::lock::{AdvisoryLock, LockWait, SentinelFileLock};
use super::{CacheEngine, CacheLock, Engine};
use crate::error::{CacheError, Result};

// == Constants ==
/// Largest serialized value accepted by default, in bytes
pub const DEFAULT_MAX_SIZE: usize = 524_288;

/// Default segment permission, as an octal string
pub const DEFAULT_PERMISSION: &str = "0700";

const PROJECT_ID: libc::c_int = b'j' as libc::c_int;
const TOKEN_PREFIX: &str = "shmop-";
const TOKEN_SUFFIX: &str = ".cache";

// == Configuration ==
/// Shared memory engine options.
#[derive(Debug, Clone)]
pub struct ShmopConfig {
    /// Maximum serialized value size in bytes
    pub max_size: usize,
    /// Octal permission string applied to new segments
    pub default_permission: String,
    /// Directory holding the token files
    pub path: PathBuf,
}

impl Default for ShmopConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            default_permission: DEFAULT_PERMISSION.to_string(),
            path: std::env::temp_dir(),
        }
    }
}

// == Attached Segment ==
/// A mapped segment, detached on drop.
struct Attached {
    addr: *mut libc::c_void,
}

impl Attached {
    fn new(id: libc::c_int, flags: libc::c_int) -> Result<Self> {
        let addr = unsafe { libc::shmat(id, ptr::null(), flags) };
        if addr as isize == -1 {
            return Err(CacheError::Storage(format!(
                "Could not attach shared memory segment: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self { addr })
    }
}

impl Drop for Attached {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.addr);
        }
    }
}

// == Shmop Cache Engine ==
/// Engine storing values in System V shared memory.
pub struct ShmopCacheEngine {
    max_size: usize,
    permission: libc::c_int,
    path: PathBuf,
    resolver: Option<Arc<dyn KeyResolver>>,
    lock: Arc<dyn AdvisoryLock>,
}

impl fmt::Debug for ShmopCacheEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmopCacheEngine")
            .field("max_size", &self.max_size)
            .field("permission", &self.permission)
            .field("path", &self.path)
            .field("resolver", &self.resolver.is_some())
            .finish_non_exhaustive()
    }
}

impl ShmopCacheEngine {
    // == Constructor ==
    /// Fails with `InvalidArgument` when the permission is not an octal string.
    pub fn new(config: ShmopConfig) -> Result<Self> {
        let permission = u32::from_str_radix(config.default_permission.trim(), 8)
            .ok()
            .filter(|mode| *mode <= 0o777)
            .ok_or_else(|| {
                CacheError::InvalidArgument(format!(
                    "Invalid shared memory permission '{}'",
                    config.default_permission
                ))
            })?;

        Ok(Self {
            max_size: config.max_size,
            permission: permission as libc::c_int,
            path: config.path,
            resolver: None,
            lock: Arc::new(SentinelFileLock::default()),
        })
    }

    /// Routes every key through `resolver` before touching storage.
    pub fn with_key_resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Replaces the sentinel-file lock protocol.
    pub fn with_lock_strategy(mut self, lock: Arc<dyn AdvisoryLock>) -> Self {
        self.lock = lock;
        self
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Token file standing for `key`.
    fn token_path(&self, key: &str) -> Result<PathBuf> {
        let key = resolve_key(self.resolver.as_deref(), key)?;
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        Ok(self
            .path
            .join(format!("{}{}{}", TOKEN_PREFIX, digest, TOKEN_SUFFIX)))
    }

    /// Existing segment id behind a token, if any.
    fn open_segment(token: &Path) -> Option<libc::c_int> {
        if !token.exists() {
            return None;
        }
        let key = segment_key(token).ok()?;
        let id = unsafe { libc::shmget(key, 0, 0) };
        (id != -1).then_some(id)
    }

    fn destroy(token: &Path) -> Result<()> {
        if let Some(id) = Self::open_segment(token) {
            unsafe {
                libc::shmctl(id, libc::IPC_RMID, ptr::null_mut());
            }
        }
        remove_if_exists(token)?;
        remove_if_exists(&ttl_path(token))?;
        Ok(())
    }

    fn is_alive(&self, token: &Path) -> bool {
        if Self::open_segment(token).is_none() {
            return false;
        }

        if let Some(expires) = read_expiry(&ttl_path(token)) {
            if now_timestamp() >= expires {
                info!("[Shmop cache] Segment too old. Ignoring '{}'", token.display());
                if let Err(e) = Self::destroy(token) {
                    warn!("[Shmop cache] Could not remove '{}': {}", token.display(), e);
                }
                return false;
            }
        }

        true
    }

    fn read_segment(id: libc::c_int) -> Result<Vec<u8>> {
        let mut stat: libc::shmid_ds = unsafe { std::mem::zeroed() };
        if unsafe { libc::shmctl(id, libc::IPC_STAT, &mut stat) } == -1 {
            return Err(CacheError::Storage(format!(
                "Could not stat shared memory segment: {}",
                std::io::Error::last_os_error()
            )));
        }

        let size = stat.shm_segsz as usize;
        let segment = Attached::new(id, libc::SHM_RDONLY)?;
        let mut bytes = vec![0u8; size];
        unsafe {
            ptr::copy_nonoverlapping(segment.addr as *const u8, bytes.as_mut_ptr(), size);
        }
        Ok(bytes)
    }

    fn write_segment(&self, token: &Path, bytes: &[u8]) -> Result<()> {
        OpenOptions::new().write(true).create(true).truncate(false).open(token)?;
        let key = segment_key(token)?;

        let id = unsafe { libc::shmget(key, bytes.len(), libc::IPC_CREAT | self.permission) };
        if id == -1 {
            return Err(CacheError::Storage(format!(
                "Could not create shared memory segment: {}",
                std::io::Error::last_os_error()
            )));
        }

        let segment = Attached::new(id, 0)?;
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), segment.addr as *mut u8, bytes.len());
        }
        Ok(())
    }
}

impl CacheEngine for ShmopCacheEngine {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let token = self.token_path(key)?;

        if self.lock.wait_until_released(&token) == LockWait::TimedOut {
            return Ok(None);
        }

        if !self.is_alive(&token) {
            debug!("[Shmop cache] Not found '{}'", key);
            return Ok(None);
        }

        let Some(id) = Self::open_segment(&token) else {
            return Ok(None);
        };
        debug!("[Shmop cache] Get '{}'", key);
        Ok(Some(decode(&Self::read_segment(id)?)?))
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Ttl>) -> Result<bool> {
        let token = self.token_path(key)?;
        Self::destroy(&token)?;

        if value.is_null() {
            return Ok(true);
        }

        let bytes = encode(&value)?;
        if bytes.len() > self.max_size {
            return Err(CacheError::Storage(format!(
                "Value of {} bytes exceeds the shared memory limit of {} bytes",
                bytes.len(),
                self.max_size
            )));
        }

        debug!("[Shmop cache] Set '{}'", key);
        self.write_segment(&token, &bytes)?;
        if let Some(expires) = add_to_now(ttl) {
            fs::write(ttl_path(&token), expires.to_string())?;
        }
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let token = self.token_path(key)?;
        Self::destroy(&token)?;
        Ok(true)
    }

    fn has(&self, key: &str) -> Result<bool> {
        let token = self.token_path(key)?;
        Ok(self.is_alive(&token))
    }

    fn clear(&self) -> Result<bool> {
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(TOKEN_PREFIX) && name.ends_with(TOKEN_SUFFIX) {
                Self::destroy(&entry.path())?;
            }
        }
        Ok(true)
    }

    fn is_available(&self) -> bool {
        is_writable_dir(&self.path)
    }
}

impl CacheLock for ShmopCacheEngine {
    fn lock(&self, key: &str) -> Result<()> {
        info!("[Shmop cache] Lock '{}'", key);
        self.lock.acquire(&self.token_path(key)?)
    }

    fn unlock(&self, key: &str) -> Result<()> {
        info!("[Shmop cache] Unlock '{}'", key);
        self.lock.release(&self.token_path(key)?)
    }
}

impl From<ShmopCacheEngine> for Engine {
    fn from(engine: ShmopCacheEngine) -> Self {
        let engine = Arc::new(engine);
        Engine::new(engine.clone()).with_locking(engine)
    }
}

/// Derives the System V key from an existing token file.
fn segment_key(token: &Path) -> Result<libc::key_t> {
    let c_path = CString::new(token.as_os_str().as_bytes())
        .map_err(|_| CacheError::InvalidArgument("Token path contains NUL".to_string()))?;

    let key = unsafe { libc::ftok(c_path.as_ptr(), PROJECT_ID) };
    if key == -1 {
        return Err(CacheError::Storage(format!(
            "Could not derive shared memory key: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(key)
}
