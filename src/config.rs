//! Configuration Module
//!
//! Runtime settings from environment variables, and named engine
//! definitions from a TOML file.
//!
//! ```toml
//! [engines.default]
//! engine = "filesystem"
//! path = "/var/cache/app"
//! create_path = true
//!
//! [engines.shared]
//! engine = "redis"
//! server = "10.0.0.5:6379"
//! ```

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::{DEFAULT_LOCK_TIMEOUT, MEMCACHED_DEFAULT_SERVER, REDIS_DEFAULT_SERVER};
use crate::error::{CacheError, Result};
use crate::pool::DEFAULT_BUFFER_SIZE;

/// Name looked up when no engine is chosen
pub const DEFAULT_ENGINE_NAME: &str = "default";

// == Runtime Config ==
/// Process configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// TOML file with `[engines.<name>]` tables
    pub config_file: Option<PathBuf>,
    /// Named engine to use
    pub engine: String,
    /// Pool buffer capacity
    pub buffer_size: usize,
    /// Garbage collection interval in seconds
    pub gc_interval: u64,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_CONFIG_FILE` - Engine definitions file (default: none)
    /// - `CACHE_ENGINE` - Named engine (default: "default")
    /// - `CACHE_BUFFER_SIZE` - Pool buffer capacity (default: 10)
    /// - `GC_INTERVAL` - Garbage collection frequency in seconds (default: 60)
    pub fn from_env() -> Self {
        Self {
            config_file: env::var("CACHE_CONFIG_FILE").ok().map(PathBuf::from),
            engine: env::var("CACHE_ENGINE").unwrap_or_else(|_| DEFAULT_ENGINE_NAME.to_string()),
            buffer_size: env::var("CACHE_BUFFER_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BUFFER_SIZE),
            gc_interval: env::var("GC_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        }
    }

    /// Resolves the configured engine name against the config file.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let engines = match &self.config_file {
            Some(path) => CacheConfig::from_file(path)?,
            None => CacheConfig::default(),
        };
        engines.named(&self.engine)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_file: None,
            engine: DEFAULT_ENGINE_NAME.to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            gc_interval: 60,
        }
    }
}

// == Engine Definitions ==
fn default_prefix() -> String {
    "cache".to_string()
}

fn default_lock_timeout() -> u64 {
    DEFAULT_LOCK_TIMEOUT.as_secs()
}

fn default_max_size() -> usize {
    524_288
}

fn default_permission() -> String {
    "0700".to_string()
}

fn default_memcached_servers() -> Vec<String> {
    vec![MEMCACHED_DEFAULT_SERVER.to_string()]
}

fn default_redis_server() -> String {
    REDIS_DEFAULT_SERVER.to_string()
}

/// One named engine definition, tagged by `engine = "<kind>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum EngineConfig {
    Null,
    Array,
    Filesystem {
        #[serde(default = "default_prefix")]
        prefix: String,
        /// Base directory, system temp dir when absent
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default)]
        create_path: bool,
        #[serde(default = "default_lock_timeout")]
        lock_timeout_secs: u64,
    },
    Tmpfs {
        #[serde(default = "default_lock_timeout")]
        lock_timeout_secs: u64,
    },
    Shmop {
        #[serde(default = "default_max_size")]
        max_size: usize,
        #[serde(default = "default_permission")]
        default_permission: String,
        /// Token directory, system temp dir when absent
        #[serde(default)]
        path: Option<PathBuf>,
    },
    Session {
        #[serde(default = "default_prefix")]
        prefix: String,
    },
    Memcached {
        #[serde(default = "default_memcached_servers")]
        servers: Vec<String>,
    },
    Redis {
        #[serde(default = "default_redis_server")]
        server: String,
        #[serde(default)]
        password: Option<String>,
    },
}

impl Default for EngineConfig {
    /// Filesystem engine in the system temp directory.
    fn default() -> Self {
        EngineConfig::Filesystem {
            prefix: default_prefix(),
            path: None,
            create_path: false,
            lock_timeout_secs: default_lock_timeout(),
        }
    }
}

impl EngineConfig {
    /// The `engine` tag value.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineConfig::Null => "null",
            EngineConfig::Array => "array",
            EngineConfig::Filesystem { .. } => "filesystem",
            EngineConfig::Tmpfs { .. } => "tmpfs",
            EngineConfig::Shmop { .. } => "shmop",
            EngineConfig::Session { .. } => "session",
            EngineConfig::Memcached { .. } => "memcached",
            EngineConfig::Redis { .. } => "redis",
        }
    }
}

// == Cache Config File ==
/// All engine definitions of a config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub engines: HashMap<String, EngineConfig>,
}

impl CacheConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| CacheError::Config(format!("Invalid cache config: {}", e)))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path).map_err(|e| {
            CacheError::Config(format!("Cannot read cache config '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&source)
    }

    /// Looks up a named engine.
    ///
    /// `default` falls back to a filesystem engine when not defined.
    pub fn named(&self, name: &str) -> Result<EngineConfig> {
        match self.engines.get(name) {
            Some(config) => Ok(config.clone()),
            None if name == DEFAULT_ENGINE_NAME => Ok(EngineConfig::default()),
            None => Err(CacheError::Config(format!("Unknown cache engine '{}'", name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [engines.default]
        engine = "filesystem"
        path = "/var/cache/app"
        create_path = true

        [engines.memory]
        engine = "array"

        [engines.shm]
        engine = "shmop"
        max_size = 1024

        [engines.shared]
        engine = "redis"
        password = "secret"
    "#;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.engine, "default");
        assert_eq!(config.buffer_size, 10);
        assert_eq!(config.gc_interval, 60);
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_config_from_env_defaults() {
        env::remove_var("CACHE_CONFIG_FILE");
        env::remove_var("CACHE_ENGINE");
        env::remove_var("CACHE_BUFFER_SIZE");
        env::remove_var("GC_INTERVAL");

        let config = Config::from_env();
        assert_eq!(config.engine, "default");
        assert_eq!(config.buffer_size, 10);
        assert_eq!(config.gc_interval, 60);
        assert_eq!(config.engine_config().unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_parse_engines() {
        let config = CacheConfig::from_toml_str(SAMPLE).unwrap();

        assert_eq!(
            config.named("default").unwrap(),
            EngineConfig::Filesystem {
                prefix: "cache".to_string(),
                path: Some(PathBuf::from("/var/cache/app")),
                create_path: true,
                lock_timeout_secs: 20,
            }
        );
        assert_eq!(config.named("memory").unwrap(), EngineConfig::Array);
        assert_eq!(
            config.named("shm").unwrap(),
            EngineConfig::Shmop {
                max_size: 1024,
                default_permission: "0700".to_string(),
                path: None,
            }
        );
        assert_eq!(
            config.named("shared").unwrap(),
            EngineConfig::Redis {
                server: "127.0.0.1:6379".to_string(),
                password: Some("secret".to_string()),
            }
        );
    }

    #[test]
    fn test_unknown_engine_name() {
        let err = CacheConfig::default().named("nope").unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn test_unknown_engine_kind() {
        let err = CacheConfig::from_toml_str("[engines.x]\nengine = \"mongo\"\n").unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn test_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.toml");
        fs::write(&path, SAMPLE).unwrap();

        let config = Config {
            config_file: Some(path),
            engine: "memory".to_string(),
            ..Config::default()
        };
        assert_eq!(config.engine_config().unwrap().kind(), "array");

        let missing = Config {
            config_file: Some(dir.path().join("missing.toml")),
            ..Config::default()
        };
        assert!(matches!(missing.engine_config(), Err(CacheError::Config(_))));
    }
}
