//! Stale-pipeline monitor.
//!
//! Pipelines stamp a `Heartbeat` every time they finish a frame. The watchdog scans
//! the registered heartbeats on an interval and warns once per camera when one goes
//! stale; the warning re-arms after fresh data arrives.

use anyhow::Result;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::signal::{join_with_timeout, StopSignal};
use crate::CameraId;

pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10);

/// Last-processed timestamp for one pipeline.
#[derive(Clone, Debug, Default)]
pub struct Heartbeat {
    last: Arc<Mutex<Option<Instant>>>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beat(&self) {
        self.beat_at(Instant::now());
    }

    pub fn beat_at(&self, at: Instant) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(at);
        }
    }

    pub fn last(&self) -> Option<Instant> {
        self.last.lock().ok().and_then(|last| *last)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct WatchdogSettings {
    pub interval: Duration,
    pub stale_after: Duration,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_WATCHDOG_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

#[derive(Default)]
struct WatchdogState {
    /// Registration time doubles as the reference for pipelines that never beat.
    pipelines: BTreeMap<CameraId, (Heartbeat, Instant)>,
    warned: HashSet<CameraId>,
}

#[derive(Clone)]
pub struct Watchdog {
    settings: WatchdogSettings,
    state: Arc<Mutex<WatchdogState>>,
}

impl Watchdog {
    pub fn new(settings: WatchdogSettings) -> Self {
        Self {
            settings,
            state: Arc::new(Mutex::new(WatchdogState::default())),
        }
    }

    pub fn register(&self, camera_id: CameraId, heartbeat: Heartbeat) {
        if let Ok(mut state) = self.state.lock() {
            state.pipelines.insert(camera_id, (heartbeat, Instant::now()));
            state.warned.remove(&camera_id);
        }
    }

    pub fn unregister(&self, camera_id: CameraId) {
        if let Ok(mut state) = self.state.lock() {
            state.pipelines.remove(&camera_id);
            state.warned.remove(&camera_id);
        }
    }

    /// Checks every pipeline against `now`. Returns the cameras newly flagged stale.
    pub fn scan(&self, now: Instant) -> Vec<CameraId> {
        let Ok(mut state) = self.state.lock() else {
            return Vec::new();
        };
        let WatchdogState { pipelines, warned } = &mut *state;
        let mut flagged = Vec::new();
        for (camera_id, (heartbeat, registered_at)) in pipelines.iter() {
            let last = heartbeat.last().unwrap_or(*registered_at);
            let age = now.saturating_duration_since(last);
            if age > self.settings.stale_after {
                if warned.insert(*camera_id) {
                    log::warn!(
                        "watchdog: camera {} stale, no frame processed for {:.1}s",
                        camera_id,
                        age.as_secs_f64()
                    );
                    flagged.push(*camera_id);
                }
            } else if warned.remove(camera_id) {
                log::info!("watchdog: camera {} recovered", camera_id);
            }
        }
        flagged
    }

    pub fn is_flagged(&self, camera_id: CameraId) -> bool {
        self.state
            .lock()
            .map(|state| state.warned.contains(&camera_id))
            .unwrap_or(false)
    }

    /// Runs `scan` every interval on a background thread until the handle is stopped.
    pub fn spawn(&self) -> Result<WatchdogHandle> {
        let stop = StopSignal::new();
        let watchdog = self.clone();
        let thread_stop = stop.clone();
        let join = std::thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || {
                while !thread_stop.wait(watchdog.settings.interval) {
                    watchdog.scan(Instant::now());
                }
            })?;
        Ok(WatchdogHandle {
            stop,
            join: Some(join),
        })
    }
}

pub struct WatchdogHandle {
    stop: StopSignal,
    join: Option<JoinHandle<()>>,
}

impl WatchdogHandle {
    pub fn stop(mut self, timeout: Duration) -> Result<()> {
        self.stop.stop();
        if let Some(join) = self.join.take() {
            join_with_timeout(join, timeout, "watchdog")?;
        }
        Ok(())
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warns_once_until_recovered() {
        let watchdog = Watchdog::new(WatchdogSettings::default());
        let heartbeat = Heartbeat::new();
        let start = Instant::now();
        heartbeat.beat_at(start);
        watchdog.register(7, heartbeat.clone());

        assert!(watchdog.scan(start + Duration::from_secs(5)).is_empty());
        assert_eq!(watchdog.scan(start + Duration::from_secs(11)), vec![7]);
        assert!(watchdog.scan(start + Duration::from_secs(16)).is_empty());
        assert!(watchdog.is_flagged(7));

        heartbeat.beat_at(start + Duration::from_secs(17));
        assert!(watchdog.scan(start + Duration::from_secs(18)).is_empty());
        assert!(!watchdog.is_flagged(7));
        assert_eq!(watchdog.scan(start + Duration::from_secs(30)), vec![7]);
    }

    #[test]
    fn background_thread_stops_promptly() -> Result<()> {
        let watchdog = Watchdog::new(WatchdogSettings {
            interval: Duration::from_millis(10),
            stale_after: Duration::from_millis(5),
        });
        watchdog.register(1, Heartbeat::new());
        let handle = watchdog.spawn()?;
        std::thread::sleep(Duration::from_millis(50));
        assert!(watchdog.is_flagged(1));
        handle.stop(Duration::from_secs(1))?;
        Ok(())
    }
}
