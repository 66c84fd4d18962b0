//! Engine Contract Tests
//!
//! Runs the same behavioural checks against every local engine through the
//! public API.

use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use polycache::engine::{
    ArrayCacheEngine, AtomicOperation, CacheEngine, CacheEngineExt, CacheLock,
    FileSystemCacheEngine, GarbageCollector, NoCacheEngine, SentinelFileLock, Session,
    SessionCacheEngine, StaticKeyResolver, Ttl,
};
use polycache::{Engine, Value};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tempfile::TempDir;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Model {
    a: i32,
    b: i32,
    tags: Vec<String>,
}

// == Helpers ==
/// Every engine that actually stores data, with the guard keeping its
/// directory alive.
fn storing_engines() -> Vec<(&'static str, Arc<dyn CacheEngine>, Option<TempDir>)> {
    let fs_dir = tempfile::tempdir().unwrap();
    let filesystem =
        FileSystemCacheEngine::new("test", Some(fs_dir.path().to_path_buf()), false).unwrap();

    #[allow(unused_mut)]
    let mut engines: Vec<(&'static str, Arc<dyn CacheEngine>, Option<TempDir>)> = vec![
        ("array", Arc::new(ArrayCacheEngine::new()), None),
        ("filesystem", Arc::new(filesystem), Some(fs_dir)),
        (
            "session",
            Arc::new(SessionCacheEngine::new(Session::new(), "cache")),
            None,
        ),
    ];

    #[cfg(target_os = "linux")]
    {
        use polycache::engine::{ShmopCacheEngine, ShmopConfig};

        let shm_dir = tempfile::tempdir().unwrap();
        let shmop = ShmopCacheEngine::new(ShmopConfig {
            path: shm_dir.path().to_path_buf(),
            ..ShmopConfig::default()
        })
        .unwrap();
        engines.push(("shmop", Arc::new(shmop), Some(shm_dir)));
    }

    engines
}

// == Contract ==
#[test]
fn test_basic_cache_scenario() {
    for (name, engine, _dir) in storing_engines() {
        engine.set("key", json!("My Value"), None).unwrap();
        assert_eq!(engine.get("key").unwrap(), Some(json!("My Value")), "{}", name);

        engine.delete("key").unwrap();
        assert_eq!(engine.get("key").unwrap(), None, "{}", name);
        engine.clear().unwrap();
    }
}

#[test]
fn test_miss_default() {
    for (name, engine, _dir) in storing_engines() {
        assert_eq!(engine.get("unset").unwrap(), None, "{}", name);
        assert_eq!(
            engine.get_or("unset", json!("default")).unwrap(),
            json!("default"),
            "{}",
            name
        );
    }
}

#[test]
fn test_idempotent_delete() {
    for (name, engine, _dir) in storing_engines() {
        assert!(engine.delete("absent").unwrap(), "{}", name);
        assert!(engine.delete("absent").unwrap(), "{}", name);
    }
}

#[test]
fn test_structured_values_roundtrip() {
    let model = Model {
        a: 10,
        b: 20,
        tags: vec!["x".to_string(), "y".to_string()],
    };

    for (name, engine, _dir) in storing_engines() {
        engine.set_as("model", &model, None).unwrap();
        assert_eq!(engine.get_as::<Model>("model").unwrap().as_ref(), Some(&model), "{}", name);

        let nested = json!([1, [2, [3, {"four": 4}]], "five"]);
        engine.set("nested", nested.clone(), None).unwrap();
        assert_eq!(engine.get("nested").unwrap(), Some(nested), "{}", name);

        engine.set("empty", json!(""), None).unwrap();
        assert!(engine.has("empty").unwrap(), "{}", name);
        assert_eq!(engine.get("empty").unwrap(), Some(json!("")), "{}", name);
        engine.clear().unwrap();
    }
}

#[test]
fn test_bulk_operations() {
    for (name, engine, _dir) in storing_engines() {
        engine
            .set_multiple(
                vec![
                    ("chave1".to_string(), json!("valor1")),
                    ("chave2".to_string(), json!("valor2")),
                ],
                Some(Ttl::Seconds(60)),
            )
            .unwrap();

        let values: Vec<Option<Value>> = engine
            .get_multiple(&["chave1", "chave2", "chave3"])
            .into_iter()
            .map(|(_, result)| result.unwrap())
            .collect();
        assert_eq!(
            values,
            vec![Some(json!("valor1")), Some(json!("valor2")), None],
            "{}",
            name
        );

        engine.delete_multiple(&["chave1", "chave2"]).unwrap();
        assert!(!engine.has("chave1").unwrap(), "{}", name);
        engine.clear().unwrap();
    }
}

#[test]
fn test_ttl_boundary() {
    // One sleep for all engines
    let engines = storing_engines();
    for (_, engine, _dir) in &engines {
        engine.set("short", json!("v"), Some(Ttl::Seconds(2))).unwrap();
        assert!(engine.has("short").unwrap());
    }

    sleep(Duration::from_secs(3));

    for (name, engine, _dir) in &engines {
        assert!(!engine.has("short").unwrap(), "{}", name);
        assert_eq!(
            engine.get_or("short", json!("default")).unwrap(),
            json!("default"),
            "{}",
            name
        );
        engine.clear().unwrap();
    }
}

#[test]
fn test_interval_ttl() {
    for (name, engine, _dir) in storing_engines() {
        let ttl = Ttl::Interval(chrono::Duration::minutes(5));
        engine.set("k", json!(1), Some(ttl)).unwrap();
        assert!(engine.has("k").unwrap(), "{}", name);
        engine.clear().unwrap();
    }
}

#[test]
fn test_key_remap() {
    let resolver = Arc::new(
        StaticKeyResolver::new()
            .with("alias1", "shared")
            .with("alias2", "shared"),
    );
    let dir = tempfile::tempdir().unwrap();
    let engines: Vec<Arc<dyn CacheEngine>> = vec![
        Arc::new(ArrayCacheEngine::new().with_key_resolver(resolver.clone())),
        Arc::new(
            FileSystemCacheEngine::new("test", Some(dir.path().to_path_buf()), false)
                .unwrap()
                .with_key_resolver(resolver.clone()),
        ),
        Arc::new(SessionCacheEngine::new(Session::new(), "cache").with_key_resolver(resolver)),
    ];

    for engine in engines {
        engine.set("alias1", json!("value"), None).unwrap();
        assert_eq!(engine.get("alias2").unwrap(), Some(json!("value")));
        assert!(engine.get("unmapped").unwrap_err().is_invalid_argument());
    }
}

#[test]
fn test_no_cache_engine_contract() {
    let engine = NoCacheEngine::new();

    assert!(engine.set("key", json!("My Value"), None).unwrap());
    assert_eq!(engine.get_or("key", json!("default")).unwrap(), json!("default"));
    assert!(engine.delete("key").unwrap());
    assert!(engine.delete("key").unwrap());
}

// == Filesystem Specifics ==
#[test]
fn test_filesystem_atomic_add_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let engine: Engine = FileSystemCacheEngine::new("test", Some(dir.path().to_path_buf()), false)
        .unwrap()
        .into();
    let atomic = engine.atomic().unwrap();

    assert_eq!(atomic.add("list", json!(10), None).unwrap(), vec![json!(10)]);
    assert_eq!(
        atomic.add("list", json!(20), None).unwrap(),
        vec![json!(10), json!(20)]
    );
    assert_eq!(engine.basic().get("list").unwrap(), Some(json!([10, 20])));
}

#[test]
fn test_filesystem_lock_timeout_across_handles() {
    let dir = tempfile::tempdir().unwrap();
    let lock = Arc::new(SentinelFileLock::new(
        Duration::from_millis(300),
        Duration::from_millis(50),
    ));

    // Two independent handles on the same directory stand in for two processes
    let writer = FileSystemCacheEngine::new("test", Some(dir.path().to_path_buf()), false)
        .unwrap()
        .with_lock_strategy(lock.clone());
    let reader = FileSystemCacheEngine::new("test", Some(dir.path().to_path_buf()), false)
        .unwrap()
        .with_lock_strategy(lock);
    let writer: Engine = writer.into();

    writer.basic().set("x", json!("value"), None).unwrap();
    writer.locking().unwrap().lock("x").unwrap();

    // The first read times out and force-clears the lock
    assert_eq!(reader.get("x").unwrap(), None);
    assert_eq!(reader.get("x").unwrap(), Some(json!("value")));
}

#[test]
fn test_filesystem_garbage_collection() {
    let dir = tempfile::tempdir().unwrap();
    let engine: Engine = FileSystemCacheEngine::new("test", Some(dir.path().to_path_buf()), false)
        .unwrap()
        .into();
    let basic = engine.basic();

    basic.set("a", json!(1), Some(Ttl::Seconds(-1))).unwrap();
    basic.set("b", json!(2), Some(Ttl::Seconds(-1))).unwrap();
    basic.set("c", json!(3), None).unwrap();

    let gc = engine.garbage_collector().unwrap();
    assert_eq!(gc.collect_garbage().unwrap(), 2);
    assert_eq!(gc.get_ttl("c").unwrap(), None);
    assert!(basic.has("c").unwrap());
}

#[test]
fn test_filesystem_counters_shared_between_handles() {
    let dir = tempfile::tempdir().unwrap();
    let first = FileSystemCacheEngine::new("test", Some(dir.path().to_path_buf()), false).unwrap();
    let second = FileSystemCacheEngine::new("test", Some(dir.path().to_path_buf()), false).unwrap();

    first.increment("hits", 1, None).unwrap();
    second.increment("hits", 1, None).unwrap();

    assert_eq!(first.decrement("hits", 1, None).unwrap(), 1);
}
