//! Polycache GC - Garbage collection daemon
//!
//! Periodically purges expired entries from a configured cache engine.

use anyhow::{bail, Context};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use polycache::{spawn_gc_task, Config, Factory};

/// Main entry point for the garbage collection daemon.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Build the named engine
/// 4. Start the background garbage collection task
/// 5. Handle graceful shutdown on SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "polycache=info,polycache_gc=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Polycache garbage collector");

    let config = Config::from_env();
    info!(
        "Configuration loaded: engine={}, gc_interval={}s",
        config.engine, config.gc_interval
    );

    let engine_config = config
        .engine_config()
        .with_context(|| format!("resolving cache engine '{}'", config.engine))?;
    let engine = Factory::create_engine(&engine_config)
        .with_context(|| format!("building '{}' engine", engine_config.kind()))?;

    if !engine.basic().is_available() {
        warn!("Engine '{}' is not available right now", config.engine);
    }

    let Some(collector) = engine.garbage_collector() else {
        bail!(
            "engine '{}' ({}) does not support garbage collection",
            config.engine,
            engine_config.kind()
        );
    };

    let gc_handle = spawn_gc_task(collector, config.gc_interval);
    info!("Background garbage collection task started");

    shutdown_signal().await?;

    gc_handle.abort();
    warn!("Garbage collection task aborted");
    info!("Shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("installing Ctrl+C handler")?;
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
    Ok(())
}
