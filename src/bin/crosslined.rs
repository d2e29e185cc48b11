//! crosslined - multi-camera crossing counter daemon
//!
//! This daemon:
//! 1. Loads configuration (file at CROSSLINE_CONFIG plus env overrides)
//! 2. Opens the status store and event sink
//! 3. Starts every enabled camera through the circuit-breaking manager
//! 4. Runs the watchdog and a supervision tick that retries offline cameras
//! 5. Shuts everything down on Ctrl-C with bounded joins

use anyhow::{Context, Result};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossline::ingest::redact_uri;
use crossline::storage::{LogEventSink, LogStatusStore};
use crossline::{
    CameraManager, CrosslineConfig, EventSink, PipelineFactory, SqliteEventSink,
    SqliteStatusStore, StartOutcome, StatusStore, Watchdog,
};

const SUPERVISE_INTERVAL: Duration = Duration::from_secs(1);
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = CrosslineConfig::load()?;

    let status: Arc<dyn StatusStore> = match &config.status_db {
        Some(path) => Arc::new(
            SqliteStatusStore::open(path).with_context(|| format!("open status db {}", path))?,
        ),
        None => Arc::new(LogStatusStore),
    };
    let sink: Arc<dyn EventSink> = match &config.events_db {
        Some(path) => Arc::new(
            SqliteEventSink::open(path).with_context(|| format!("open events db {}", path))?,
        ),
        None => Arc::new(LogEventSink),
    };
    std::fs::create_dir_all(&config.snapshot_dir).with_context(|| {
        format!("create snapshot dir {}", config.snapshot_dir.display())
    })?;

    let factory = PipelineFactory::from_config(&config, sink);
    log::info!("detectors available: {}", factory.registry.list().join(", "));

    let watchdog = Watchdog::new(config.watchdog);
    let watchdog_handle = watchdog.spawn()?;
    let manager = CameraManager::from_config(&config, factory)
        .with_status_store(status)
        .with_watchdog(watchdog);

    log::info!(
        "crosslined {} running with {} camera(s)",
        env!("CARGO_PKG_VERSION"),
        config.cameras.len()
    );
    for camera in &config.cameras {
        log::info!(
            "camera {} ({}) kind={:?} enabled={} uri={}",
            camera.id,
            camera.name,
            camera.kind,
            camera.enabled,
            redact_uri(&camera.uri)
        );
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    let mut last_health_log = Instant::now();
    loop {
        for (id, ticket) in manager.supervise() {
            // Outcomes still in flight are reported by the manager's own logs.
            if let Some(StartOutcome::Failed(err)) = ticket.wait(Duration::ZERO) {
                log::debug!("camera {} start failed: {}", id, err);
            }
        }

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            log_health(&manager);
            last_health_log = Instant::now();
        }

        match rx.recv_timeout(SUPERVISE_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    log::info!("shutdown signal received, stopping cameras...");
    manager.shutdown(SHUTDOWN_TIMEOUT);
    watchdog_handle.stop(SHUTDOWN_TIMEOUT)?;
    log::info!("crosslined stopped");
    Ok(())
}

fn log_health(manager: &CameraManager) {
    for id in manager.camera_ids() {
        let status = manager.status(id);
        match manager.health(id) {
            Some(health) => log::info!(
                "health: camera={} breaker={} fps={:.1} captured={} skipped={} dropped={} restarts={} last_frame_age={:?}",
                id,
                status.breaker,
                health.capture_fps,
                health.frames_captured,
                health.frames_skipped,
                health.frames_dropped,
                health.restarts,
                health.last_frame_age()
            ),
            None => log::info!(
                "health: camera={} offline breaker={} fails={} last_error={}",
                id,
                status.breaker,
                status.fail_count,
                status.last_error.as_deref().unwrap_or("-")
            ),
        }
    }
}
