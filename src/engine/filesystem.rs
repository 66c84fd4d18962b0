//! FileSystem Cache Engine
//!
//! One content file per key, plus optional sidecars:
//! - `<file>.ttl`: absolute expiry as decimal Unix seconds
//! - `<file>.lock`: advisory write lock (see [`SentinelFileLock`])
//!
//! Content writes and read-modify-write operations hold an OS-level
//! exclusive `flock` on the content file for their whole duration.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::base::{add_to_now, now_timestamp, resolve_key, KeyResolver, Ttl};
use super::codec::{decode, encode};
use super::lock::{AdvisoryLock, LockWait, SentinelFileLock};
use super::{append_to_list, AtomicOperation, CacheEngine, CacheLock, Engine, GarbageCollector};
use crate::error::Result;

// == Constants ==
/// Directory used by the tmpfs preset
pub const TMPFS_PATH: &str = "/dev/shm";

const CONTENT_SUFFIX: &str = ".cache";
const TTL_SUFFIX: &str = ".ttl";

// == File Guard ==
/// Holds an OS advisory lock on an open file until dropped.
struct FileGuard {
    file: File,
}

impl FileGuard {
    fn exclusive(file: File) -> io::Result<Self> {
        flock(&file, FlockMode::Exclusive)?;
        Ok(Self { file })
    }

    fn shared(file: File) -> io::Result<Self> {
        flock(&file, FlockMode::Shared)?;
        Ok(Self { file })
    }

    fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    fn replace_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(bytes)?;
        self.file.flush()
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = flock(&self.file, FlockMode::Unlock);
    }
}

#[derive(Clone, Copy)]
enum FlockMode {
    Shared,
    Exclusive,
    Unlock,
}

#[cfg(unix)]
fn flock(file: &File, mode: FlockMode) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let operation = match mode {
        FlockMode::Shared => libc::LOCK_SH,
        FlockMode::Exclusive => libc::LOCK_EX,
        FlockMode::Unlock => libc::LOCK_UN,
    };
    let result = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn flock(_file: &File, _mode: FlockMode) -> io::Result<()> {
    Ok(())
}

/// How `put_contents` produces the value it writes.
enum Contents<'a> {
    Replace(Value),
    Modify(&'a dyn Fn(Option<Value>) -> Value),
}

// == FileSystem Cache Engine ==
/// Stores each key as a file under a base directory.
pub struct FileSystemCacheEngine {
    prefix: String,
    path: PathBuf,
    resolver: Option<Arc<dyn KeyResolver>>,
    lock: Arc<dyn AdvisoryLock>,
}

impl FileSystemCacheEngine {
    // == Constructor ==
    /// Creates an engine writing `<path>/<prefix>-<key>.cache` files.
    ///
    /// `path` defaults to the system temp directory. With `create_path`
    /// the directory is created when missing.
    pub fn new(
        prefix: impl Into<String>,
        path: Option<PathBuf>,
        create_path: bool,
    ) -> Result<Self> {
        let path = path.unwrap_or_else(std::env::temp_dir);
        if create_path && !path.exists() {
            fs::create_dir_all(&path)?;
        }

        Ok(Self {
            prefix: prefix.into(),
            path,
            resolver: None,
            lock: Arc::new(SentinelFileLock::default()),
        })
    }

    /// Filesystem engine backed by the tmpfs mount at `/dev/shm`.
    pub fn tmpfs() -> Result<Self> {
        Self::new("cache", Some(PathBuf::from(TMPFS_PATH)), false)
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

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    // == Key To Path ==
    /// Maps a logical key to its content file.
    fn fix_key(&self, key: &str) -> Result<PathBuf> {
        let key = resolve_key(self.resolver.as_deref(), key)?;
        Ok(self
            .path
            .join(format!("{}-{}{}", self.prefix, escape_key(&key), CONTENT_SUFFIX)))
    }

    /// Escaped keys never contain `-`, so the first `-` after our prefix
    /// must be the separator.
    fn owns(&self, file_name: &str) -> bool {
        file_name
            .strip_prefix(&format!("{}-", self.prefix))
            .is_some_and(|rest| !rest.contains('-'))
    }

    /// Lazy expiry: removes the entry and reports false once its TTL passed.
    fn is_alive(&self, file_key: &Path) -> bool {
        if !file_key.exists() {
            return false;
        }

        if let Some(expires) = read_expiry(&ttl_path(file_key)) {
            if now_timestamp() >= expires {
                info!("[Filesystem cache] File too old. Ignoring '{}'", file_key.display());
                remove_entry(file_key);
                return false;
            }
        }

        true
    }

    fn get_contents(&self, file_key: &Path) -> Result<Option<Value>> {
        let file = match File::open(file_key) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let bytes = FileGuard::shared(file)?.read_all()?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(decode(&bytes)?))
    }

    fn put_contents(&self, file_key: &Path, write: Contents<'_>, expires_at: Option<i64>) -> Result<Value> {
        remove_if_exists(&ttl_path(file_key))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(file_key)?;
        let mut guard = FileGuard::exclusive(file)?;

        let value = match write {
            Contents::Replace(value) => value,
            Contents::Modify(operation) => {
                let bytes = guard.read_all()?;
                let current = if bytes.is_empty() {
                    None
                } else {
                    Some(decode(&bytes)?)
                };
                operation(current)
            }
        };

        guard.replace_all(&encode(&value)?)?;
        if let Some(expires) = expires_at {
            fs::write(ttl_path(file_key), expires.to_string())?;
        }

        Ok(value)
    }

    fn modify(&self, key: &str, ttl: Option<Ttl>, operation: &dyn Fn(Option<Value>) -> Value) -> Result<Value> {
        let file_key = self.fix_key(key)?;
        // An expired entry counts as absent for the operation.
        self.is_alive(&file_key);
        self.put_contents(&file_key, Contents::Modify(operation), add_to_now(ttl))
    }

    fn entries(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut owned = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if self.owns(name) {
                    owned.push((name.to_string(), entry.path()));
                }
            }
        }
        Ok(owned)
    }
}

impl CacheEngine for FileSystemCacheEngine {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let file_key = self.fix_key(key)?;

        if self.lock.wait_until_released(&file_key) == LockWait::TimedOut {
            return Ok(None);
        }

        if !self.is_alive(&file_key) {
            debug!("[Filesystem cache] Not found '{}'", key);
            return Ok(None);
        }

        debug!("[Filesystem cache] Get '{}'", key);
        match self.get_contents(&file_key) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("[Filesystem cache] Could not read '{}': {}", key, e);
                Ok(None)
            }
        }
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Ttl>) -> Result<bool> {
        let file_key = self.fix_key(key)?;

        if value.is_null() {
            remove_entry(&file_key);
            return Ok(true);
        }

        debug!("[Filesystem cache] Set '{}' in FileSystem", key);
        match self.put_contents(&file_key, Contents::Replace(value), add_to_now(ttl)) {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(
                    "[Filesystem cache] I could not write to cache on file '{}': {}. Switching to nocache mode.",
                    key, e
                );
                Ok(false)
            }
        }
    }

    fn delete(&self, key: &str) -> Result<bool> {
        self.set(key, Value::Null, None)
    }

    fn has(&self, key: &str) -> Result<bool> {
        let file_key = self.fix_key(key)?;
        Ok(self.is_alive(&file_key))
    }

    fn clear(&self) -> Result<bool> {
        for (name, path) in self.entries()? {
            if name.ends_with(CONTENT_SUFFIX) || name.ends_with(TTL_SUFFIX) {
                remove_if_exists(&path)?;
            }
        }
        Ok(true)
    }

    fn is_available(&self) -> bool {
        is_writable_dir(&self.path)
    }
}

impl CacheLock for FileSystemCacheEngine {
    fn lock(&self, key: &str) -> Result<()> {
        info!("[Filesystem cache] Lock '{}'", key);
        self.lock.acquire(&self.fix_key(key)?)
    }

    fn unlock(&self, key: &str) -> Result<()> {
        info!("[Filesystem cache] Unlock '{}'", key);
        self.lock.release(&self.fix_key(key)?)
    }
}

impl AtomicOperation for FileSystemCacheEngine {
    fn increment(&self, key: &str, by: i64, ttl: Option<Ttl>) -> Result<i64> {
        let value = self.modify(key, ttl, &|current| Value::from(as_integer(current) + by))?;
        Ok(value.as_i64().unwrap_or_default())
    }

    fn decrement(&self, key: &str, by: i64, ttl: Option<Ttl>) -> Result<i64> {
        let value = self.modify(key, ttl, &|current| Value::from(as_integer(current) - by))?;
        Ok(value.as_i64().unwrap_or_default())
    }

    fn add(&self, key: &str, value: Value, ttl: Option<Ttl>) -> Result<Vec<Value>> {
        let list = self.modify(key, ttl, &|current| {
            Value::Array(append_to_list(current, value.clone()))
        })?;

        match list {
            Value::Array(items) => Ok(items),
            other => Ok(vec![other]),
        }
    }
}

impl GarbageCollector for FileSystemCacheEngine {
    fn collect_garbage(&self) -> Result<usize> {
        let now = now_timestamp();
        let mut removed = 0;

        for (name, ttl_file) in self.entries()? {
            if !name.ends_with(TTL_SUFFIX) {
                continue;
            }
            let Some(expires) = read_expiry(&ttl_file) else {
                continue;
            };
            if now >= expires {
                let content = self.path.join(&name[..name.len() - TTL_SUFFIX.len()]);
                remove_if_exists(&content)?;
                remove_if_exists(&ttl_file)?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("[Filesystem cache] Garbage collection removed {} entries", removed);
        }
        Ok(removed)
    }

    fn get_ttl(&self, key: &str) -> Result<Option<i64>> {
        let file_key = self.fix_key(key)?;
        Ok(read_expiry(&ttl_path(&file_key)))
    }
}

impl From<FileSystemCacheEngine> for Engine {
    fn from(engine: FileSystemCacheEngine) -> Self {
        let engine = Arc::new(engine);
        Engine::new(engine.clone())
            .with_locking(engine.clone())
            .with_atomic(engine.clone())
            .with_garbage_collector(engine)
    }
}

// == Helpers ==
/// Escapes characters that could leave the cache directory or collide.
fn escape_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '/' => escaped.push_str("%2F"),
            '\\' => escaped.push_str("%5C"),
            '\0' => escaped.push_str("%00"),
            '-' => escaped.push_str("%2D"),
            _ => escaped.push(c),
        }
    }
    escaped
}

pub(super) fn ttl_path(file_key: &Path) -> PathBuf {
    let mut path = file_key.as_os_str().to_owned();
    path.push(TTL_SUFFIX);
    PathBuf::from(path)
}

pub(super) fn read_expiry(ttl_file: &Path) -> Option<i64> {
    fs::read_to_string(ttl_file).ok()?.trim().parse().ok()
}

pub(super) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn remove_entry(file_key: &Path) {
    for path in [file_key.to_path_buf(), ttl_path(file_key)] {
        if let Err(e) = remove_if_exists(&path) {
            warn!("[Filesystem cache] Could not remove '{}': {}", path.display(), e);
        }
    }
}

fn as_integer(value: Option<Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or_default(),
        Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
        Some(Value::Bool(b)) => i64::from(b),
        _ => 0,
    }
}

#[cfg(unix)]
pub(super) fn is_writable_dir(path: &Path) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    if !path.is_dir() {
        return false;
    }
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
}

#[cfg(not(unix))]
pub(super) fn is_writable_dir(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_dir() && !m.permissions().readonly())
        .unwrap_or(false)
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;
    use std::time::Duration;

    fn engine_in(dir: &tempfile::TempDir) -> FileSystemCacheEngine {
        FileSystemCacheEngine::new("test", Some(dir.path().to_path_buf()), false).unwrap()
    }

    #[test]
    fn test_basic_cache_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir);

        engine.set("key", json!("My Value"), None).unwrap();
        assert_eq!(engine.get("key").unwrap(), Some(json!("My Value")));

        engine.delete("key").unwrap();
        assert_eq!(engine.get("key").unwrap(), None);
    }

    #[test]
    fn test_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir);

        engine.set("chave", json!(1), Some(Ttl::Seconds(60))).unwrap();

        let content = dir.path().join("test-chave.cache");
        assert!(content.exists());
        let expiry: i64 = fs::read_to_string(ttl_path(&content))
            .unwrap()
            .parse()
            .unwrap();
        assert!(expiry > now_timestamp());
    }

    #[test]
    fn test_key_cannot_traverse_directories() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir);

        engine.set("../../etc/passwd", json!("x"), None).unwrap();
        engine.set("a\\b", json!("y"), None).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| !n.contains('/') && !n.contains('\\')));
        assert_eq!(engine.get("../../etc/passwd").unwrap(), Some(json!("x")));
    }

    #[test]
    fn test_escaping_is_collision_free() {
        assert_ne!(escape_key("a/b"), escape_key("a%2Fb"));
        assert_ne!(escape_key("a/b"), escape_key("a\\b"));
        assert!(!escape_key("a-b").contains('-'));
    }

    #[test]
    fn test_empty_string_and_null() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir);

        engine.set("empty", json!(""), None).unwrap();
        assert!(engine.has("empty").unwrap());
        assert_eq!(engine.get("empty").unwrap(), Some(json!("")));

        engine.set("empty", Value::Null, None).unwrap();
        assert!(!engine.has("empty").unwrap());
    }

    #[test]
    fn test_ttl_expiration_is_lazy() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir);

        engine.set("old", json!("v"), Some(Ttl::Seconds(-1))).unwrap();
        assert!(dir.path().join("test-old.cache").exists());

        assert!(!engine.has("old").unwrap());
        assert!(!dir.path().join("test-old.cache").exists());
    }

    #[test]
    fn test_set_replaces_previous_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir);

        engine.set("k", json!(1), Some(Ttl::Seconds(60))).unwrap();
        assert!(engine.get_ttl("k").unwrap().is_some());

        engine.set("k", json!(2), None).unwrap();
        assert_eq!(engine.get_ttl("k").unwrap(), None);
    }

    #[test]
    fn test_collect_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir);

        engine.set("expired", json!(1), Some(Ttl::Seconds(-5))).unwrap();
        engine.set("alive", json!(2), Some(Ttl::Seconds(60))).unwrap();
        engine.set("forever", json!(3), None).unwrap();

        assert_eq!(engine.collect_garbage().unwrap(), 1);
        assert!(!dir.path().join("test-expired.cache").exists());
        assert!(!dir.path().join("test-expired.cache.ttl").exists());
        assert!(engine.has("alive").unwrap());
        assert!(engine.has("forever").unwrap());
    }

    #[test]
    fn test_clear_is_scoped_to_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let ours = engine_in(&dir);
        let theirs =
            FileSystemCacheEngine::new("other", Some(dir.path().to_path_buf()), false).unwrap();

        ours.set("a", json!(1), Some(Ttl::Seconds(60))).unwrap();
        theirs.set("a", json!(2), None).unwrap();

        ours.clear().unwrap();
        assert!(!ours.has("a").unwrap());
        assert_eq!(theirs.get("a").unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_clear_ignores_longer_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = Some(dir.path().to_path_buf());
        let short = FileSystemCacheEngine::new("app", path.clone(), false).unwrap();
        let long = FileSystemCacheEngine::new("app-x", path, false).unwrap();

        short.set("my-key", json!(1), Some(Ttl::Seconds(60))).unwrap();
        long.set("k", json!(2), None).unwrap();
        assert!(dir.path().join("app-my%2Dkey.cache").exists());

        short.clear().unwrap();
        assert!(!short.has("my-key").unwrap());
        assert_eq!(long.get("k").unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_atomic_add() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir);

        assert_eq!(engine.add("list", json!(10), None).unwrap(), vec![json!(10)]);
        assert_eq!(
            engine.add("list", json!(20), None).unwrap(),
            vec![json!(10), json!(20)]
        );
        assert_eq!(engine.get("list").unwrap(), Some(json!([10, 20])));
    }

    #[test]
    fn test_add_to_scalar() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir);

        engine.set("scalar", json!("first"), None).unwrap();
        assert_eq!(
            engine.add("scalar", json!("second"), None).unwrap(),
            vec![json!("first"), json!("second")]
        );
    }

    #[test]
    fn test_increment_and_decrement() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir);

        assert_eq!(engine.increment("counter", 1, None).unwrap(), 1);
        assert_eq!(engine.increment("counter", 5, None).unwrap(), 6);
        assert_eq!(engine.decrement("counter", 2, None).unwrap(), 4);
        assert_eq!(engine.get("counter").unwrap(), Some(json!(4)));

        assert_eq!(engine.decrement("fresh", 3, Some(Ttl::Seconds(60))).unwrap(), -3);
        assert!(engine.get_ttl("fresh").unwrap().is_some());
    }

    #[test]
    fn test_concurrent_increments() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(engine_in(&dir));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    for _ in 0..25 {
                        engine.increment("hits", 1, None).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(engine.get("hits").unwrap(), Some(json!(100)));
    }

    #[test]
    fn test_lock_timeout_forces_miss() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir).with_lock_strategy(Arc::new(SentinelFileLock::new(
            Duration::from_millis(200),
            Duration::from_millis(50),
        )));

        engine.set("x", json!("value"), None).unwrap();
        engine.lock("x").unwrap();

        // The holder never unlocks: the reader gives up, clears the lock, misses.
        assert_eq!(engine.get("x").unwrap(), None);
        assert_eq!(engine.get("x").unwrap(), Some(json!("value")));
    }

    #[test]
    fn test_lock_released_by_holder() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(engine_in(&dir).with_lock_strategy(Arc::new(
            SentinelFileLock::new(Duration::from_secs(5), Duration::from_millis(20)),
        )));

        engine.lock("x").unwrap();
        let writer = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                engine.set("x", json!("fresh"), None).unwrap();
                engine.unlock("x").unwrap();
            })
        };

        writer.join().unwrap();
        assert_eq!(engine.get("x").unwrap(), Some(json!("fresh")));
    }

    #[test]
    fn test_unavailable_path() {
        let engine = FileSystemCacheEngine::new(
            "test",
            Some(PathBuf::from("/nonexistent/polycache/dir")),
            false,
        )
        .unwrap();

        assert!(!engine.is_available());
        // Writes degrade to a soft failure
        assert!(!engine.set("k", json!(1), None).unwrap());
        assert_eq!(engine.get("k").unwrap(), None);
    }

    #[test]
    fn test_create_path() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let engine = FileSystemCacheEngine::new("test", Some(nested.clone()), true).unwrap();

        assert!(nested.is_dir());
        assert!(engine.is_available());
    }
}
