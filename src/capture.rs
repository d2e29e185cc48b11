//! Per-camera capture loop.
//!
//! A `CaptureWorker` owns the camera's `FrameSource` on a dedicated thread. It reads
//! frames, applies frame skipping, refreshes the camera's slot in the last-frame
//! cache and pushes into the pipeline's `FrameQueue`. Read failures are retried in
//! place up to `max_read_failures`; an unhealthy source or an explicit restart
//! request re-runs backend selection with backoff. After `max_restarts` consecutive
//! failed re-opens the worker exits with `CONNECT_FAILED`.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::backoff::Backoff;
use crate::frame::{mean_abs_diff, Frame, FrameQueue};
use crate::ingest::{
    open_capture, redact_uri, Backend, CaptureError, FrameSource, SourceError, SourceSpec,
    Transport,
};
use crate::signal::StopSignal;
use crate::CameraId;

pub const DEFAULT_MAX_READ_FAILURES: u32 = 30;
pub const DEFAULT_MAX_RESTARTS: u32 = 10;
pub const MAX_ADAPTIVE_SKIP: u32 = 10;
/// Mean absolute luma difference below which a frame counts as static.
pub const LOW_MOTION_THRESHOLD: f32 = 2.0;

#[derive(Clone, Debug)]
pub struct CaptureSettings {
    pub max_read_failures: u32,
    pub read_failure_pause: Duration,
    pub read_timeout: Duration,
    pub max_restarts: u32,
    pub restart_backoff_base: Duration,
    pub restart_backoff_max: Duration,
    pub frame_skip: u32,
    pub adaptive_skip: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            max_read_failures: DEFAULT_MAX_READ_FAILURES,
            read_failure_pause: Duration::from_millis(100),
            read_timeout: Duration::from_secs(1),
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_backoff_base: Duration::from_secs(1),
            restart_backoff_max: Duration::from_secs(10),
            frame_skip: 1,
            adaptive_skip: false,
        }
    }
}

// ----------------------------------------------------------------------------
// Last-frame cache
// ----------------------------------------------------------------------------

/// One camera's entry in the last-frame cache. Only that camera's capture thread
/// writes it; readers get a copy.
#[derive(Clone, Default)]
pub struct CacheSlot {
    frame: Arc<Mutex<Option<Frame>>>,
}

impl CacheSlot {
    pub fn store(&self, frame: Frame) {
        if let Ok(mut slot) = self.frame.lock() {
            *slot = Some(frame);
        }
    }

    pub fn latest(&self) -> Option<Frame> {
        self.frame.lock().ok().and_then(|slot| slot.clone())
    }

    /// Copy of the cached frame if it was captured within `max_age`.
    pub fn fresh(&self, max_age: Duration) -> Option<Frame> {
        let slot = self.frame.lock().ok()?;
        slot.as_ref()
            .filter(|frame| frame.age() <= max_age)
            .cloned()
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.frame.lock() {
            *slot = None;
        }
    }
}

/// Last-known frame per camera, owned by one manager instance. The map lock is
/// only held to look up or insert a slot; each slot has its own lock.
#[derive(Clone, Default)]
pub struct FrameCache {
    slots: Arc<RwLock<HashMap<CameraId, CacheSlot>>>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, camera_id: CameraId) -> CacheSlot {
        if let Some(slot) = self
            .slots
            .read()
            .ok()
            .and_then(|slots| slots.get(&camera_id).cloned())
        {
            return slot;
        }
        match self.slots.write() {
            Ok(mut slots) => slots.entry(camera_id).or_default().clone(),
            Err(_) => CacheSlot::default(),
        }
    }

    pub fn latest(&self, camera_id: CameraId) -> Option<Frame> {
        self.slots
            .read()
            .ok()
            .and_then(|slots| slots.get(&camera_id).cloned())
            .and_then(|slot| slot.latest())
    }

    pub fn fresh(&self, camera_id: CameraId, max_age: Duration) -> Option<Frame> {
        self.slots
            .read()
            .ok()
            .and_then(|slots| slots.get(&camera_id).cloned())
            .and_then(|slot| slot.fresh(max_age))
    }
}

// ----------------------------------------------------------------------------
// Health
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default, Serialize)]
pub struct CaptureHealth {
    pub camera_id: CameraId,
    pub online: bool,
    pub backend: Option<Backend>,
    pub transport: Option<Transport>,
    pub frames_captured: u64,
    pub frames_skipped: u64,
    pub frames_dropped: u64,
    pub consecutive_failures: u32,
    pub restarts: u32,
    pub current_skip: u32,
    pub capture_fps: f32,
    pub jitter_ms: f32,
    pub last_status: Option<String>,
    pub last_error: Option<String>,
    pub stderr_tail: Vec<String>,
    #[serde(skip)]
    pub last_frame_at: Option<Instant>,
    #[serde(skip)]
    interval_ema: Option<f64>,
}

impl CaptureHealth {
    pub fn new(camera_id: CameraId) -> Self {
        Self {
            camera_id,
            current_skip: 1,
            ..Self::default()
        }
    }

    pub fn last_frame_age(&self) -> Option<Duration> {
        self.last_frame_at.map(|at| at.elapsed())
    }

    fn record_frame(&mut self, at: Instant) {
        if let Some(prev) = self.last_frame_at {
            let dt = at.saturating_duration_since(prev).as_secs_f64();
            let ema = match self.interval_ema {
                Some(ema) => 0.9 * ema + 0.1 * dt,
                None => dt,
            };
            self.interval_ema = Some(ema);
            if ema > 0.0 {
                self.capture_fps = (1.0 / ema) as f32;
            }
            let deviation = ((dt - ema).abs() * 1000.0) as f32;
            self.jitter_ms = 0.9 * self.jitter_ms + 0.1 * deviation;
        }
        self.last_frame_at = Some(at);
        self.frames_captured += 1;
        self.consecutive_failures = 0;
        self.last_status = Some("ok".to_string());
    }

    fn record_open(&mut self, source: &FrameSource) {
        let info = source.info();
        self.online = true;
        self.backend = Some(source.backend());
        self.transport = info.transport;
        self.interval_ema = None;
        self.last_status = Some("open".to_string());
    }
}

pub type SharedHealth = Arc<Mutex<CaptureHealth>>;

// ----------------------------------------------------------------------------
// Frame skipping
// ----------------------------------------------------------------------------

/// Decides which frames go downstream. With adaptive skipping the skip widens by one
/// per static frame up to `MAX_ADAPTIVE_SKIP` and narrows by one per moving frame.
#[derive(Debug)]
pub struct SkipController {
    skip: u32,
    adaptive: bool,
    frame_index: u64,
    previous_gray: Option<Vec<u8>>,
}

impl SkipController {
    pub fn new(skip: u32, adaptive: bool) -> Self {
        Self {
            skip: skip.max(1),
            adaptive,
            frame_index: 0,
            previous_gray: None,
        }
    }

    pub fn configure(&mut self, skip: u32, adaptive: bool) {
        if adaptive != self.adaptive || (!adaptive && skip.max(1) != self.skip) {
            self.skip = skip.max(1);
            self.adaptive = adaptive;
            self.previous_gray = None;
        }
    }

    pub fn skip(&self) -> u32 {
        self.skip
    }

    /// Returns true when `frame` should be forwarded.
    pub fn admit(&mut self, frame: &Frame) -> bool {
        self.frame_index += 1;
        if self.adaptive {
            self.observe_motion(frame.to_gray());
        }
        self.admit_index()
    }

    fn observe_motion(&mut self, gray: Vec<u8>) {
        if let Some(previous) = &self.previous_gray {
            let motion = mean_abs_diff(previous, &gray);
            if motion < LOW_MOTION_THRESHOLD {
                self.skip = (self.skip + 1).min(MAX_ADAPTIVE_SKIP);
            } else {
                self.skip = self.skip.saturating_sub(1).max(1);
            }
        }
        self.previous_gray = Some(gray);
    }

    fn admit_index(&self) -> bool {
        self.skip <= 1 || (self.frame_index - 1) % self.skip as u64 == 0
    }
}

// ----------------------------------------------------------------------------
// Worker
// ----------------------------------------------------------------------------

/// Shared control surface between a running worker and its owner.
pub struct CaptureControl {
    stop: StopSignal,
    restart: AtomicBool,
    frame_skip: AtomicU32,
    adaptive_skip: AtomicBool,
    source: Mutex<(SourceSpec, Vec<Backend>)>,
}

impl CaptureControl {
    pub fn new(spec: SourceSpec, priority: Vec<Backend>, settings: &CaptureSettings) -> Self {
        Self {
            stop: StopSignal::new(),
            restart: AtomicBool::new(false),
            frame_skip: AtomicU32::new(settings.frame_skip.max(1)),
            adaptive_skip: AtomicBool::new(settings.adaptive_skip),
            source: Mutex::new((spec, priority)),
        }
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::SeqCst);
    }

    pub fn set_skip(&self, frame_skip: u32, adaptive: bool) {
        self.frame_skip.store(frame_skip.max(1), Ordering::SeqCst);
        self.adaptive_skip.store(adaptive, Ordering::SeqCst);
    }

    /// Replaces the source used by the next (re)open.
    pub fn set_source(&self, spec: SourceSpec, priority: Vec<Backend>) {
        if let Ok(mut source) = self.source.lock() {
            *source = (spec, priority);
        }
    }

    fn source(&self) -> Option<(SourceSpec, Vec<Backend>)> {
        self.source.lock().ok().map(|source| source.clone())
    }

    fn take_restart(&self) -> bool {
        self.restart.swap(false, Ordering::SeqCst)
    }
}

pub struct CaptureWorker {
    camera_id: CameraId,
    settings: CaptureSettings,
    control: Arc<CaptureControl>,
    queue: Arc<FrameQueue<Frame>>,
    cache: CacheSlot,
    health: SharedHealth,
}

impl CaptureWorker {
    pub fn new(
        camera_id: CameraId,
        settings: CaptureSettings,
        control: Arc<CaptureControl>,
        queue: Arc<FrameQueue<Frame>>,
        cache: CacheSlot,
        health: SharedHealth,
    ) -> Self {
        Self {
            camera_id,
            settings,
            control,
            queue,
            cache,
            health,
        }
    }

    /// Starts the loop on `capture-<id>`, reading from an already opened `source`.
    pub fn spawn(
        self,
        source: FrameSource,
    ) -> std::io::Result<JoinHandle<Result<(), CaptureError>>> {
        std::thread::Builder::new()
            .name(format!("capture-{}", self.camera_id))
            .spawn(move || self.run(source))
    }

    pub fn run(self, source: FrameSource) -> Result<(), CaptureError> {
        let mut current = Some(source);
        let result = self.read_loop(&mut current);
        if let Some(mut source) = current.take() {
            source.close();
        }
        self.update_health(|health| {
            health.online = false;
            if let Err(err) = &result {
                health.last_error = Some(err.to_string());
            }
        });
        match &result {
            Ok(()) => log::info!("capture[{}]: stopped", self.camera_id),
            Err(err) => log::error!("capture[{}]: giving up: {}", self.camera_id, err),
        }
        result
    }

    fn read_loop(&self, current: &mut Option<FrameSource>) -> Result<(), CaptureError> {
        let stop = self.control.stop_signal();
        let mut skipper = SkipController::new(
            self.control.frame_skip.load(Ordering::SeqCst),
            self.control.adaptive_skip.load(Ordering::SeqCst),
        );
        let mut failures = 0u32;
        if let Some(source) = current.as_ref() {
            self.update_health(|health| health.record_open(source));
        }

        while !stop.is_stopped() {
            if self.control.take_restart() || current.is_none() {
                if let Some(mut old) = current.take() {
                    old.close();
                }
                self.update_health(|health| health.online = false);
                let Some(source) = self.reopen(&stop)? else {
                    return Ok(());
                };
                self.update_health(|health| {
                    health.record_open(&source);
                    health.restarts += 1;
                });
                *current = Some(source);
                failures = 0;
                continue;
            }
            let Some(source) = current.as_mut() else {
                continue;
            };

            skipper.configure(
                self.control.frame_skip.load(Ordering::SeqCst),
                self.control.adaptive_skip.load(Ordering::SeqCst),
            );
            match source.read(self.settings.read_timeout) {
                Ok(frame) => {
                    failures = 0;
                    let admitted = skipper.admit(&frame);
                    let at = frame.captured_at;
                    self.update_health(|health| {
                        health.record_frame(at);
                        health.current_skip = skipper.skip();
                        if !admitted {
                            health.frames_skipped += 1;
                        }
                    });
                    if !admitted {
                        continue;
                    }
                    self.cache.store(frame.clone());
                    let evicted = self.queue.push(frame);
                    if evicted > 0 {
                        self.update_health(|health| health.frames_dropped += evicted as u64);
                    }
                }
                Err(err) => {
                    failures += 1;
                    let healthy = source.is_healthy();
                    let stderr_tail = source.diagnostics();
                    self.update_health(|health| {
                        health.consecutive_failures = failures;
                        health.last_status = Some(err.to_string());
                        health.stderr_tail = stderr_tail;
                    });
                    if !healthy || failures >= self.settings.max_read_failures {
                        log::warn!(
                            "capture[{}]: restarting {} after {} read failure(s) ({}, healthy={})",
                            self.camera_id,
                            source.backend(),
                            failures,
                            err,
                            healthy
                        );
                        self.control.request_restart();
                        continue;
                    }
                    if err != SourceError::ReadTimeout {
                        stop.wait(self.settings.read_failure_pause);
                    }
                }
            }
        }
        Ok(())
    }

    /// Re-runs backend selection with backoff. `Ok(None)` means stop was requested.
    fn reopen(&self, stop: &StopSignal) -> Result<Option<FrameSource>, CaptureError> {
        let mut backoff = Backoff::new(
            self.settings.restart_backoff_base,
            self.settings.restart_backoff_max,
        );
        let Some((spec, priority)) = self.control.source() else {
            return Err(CaptureError::Launch("capture control poisoned".to_string()));
        };
        for attempt in 1..=self.settings.max_restarts.max(1) {
            let delay = backoff.next();
            if stop.wait(delay) {
                return Ok(None);
            }
            match open_capture(&spec, &priority) {
                Ok(source) => {
                    log::info!(
                        "capture[{}]: reopened backend={} uri={} after {} attempt(s)",
                        self.camera_id,
                        source.backend(),
                        redact_uri(&spec.uri),
                        attempt
                    );
                    return Ok(Some(source));
                }
                Err(err) => {
                    log::warn!(
                        "capture[{}]: reopen attempt {} failed: {}",
                        self.camera_id,
                        attempt,
                        err
                    );
                    self.update_health(|health| health.last_error = Some(err.to_string()));
                }
            }
        }
        Err(CaptureError::ConnectFailed {
            attempts: self.settings.max_restarts.max(1),
        })
    }

    fn update_health(&self, f: impl FnOnce(&mut CaptureHealth)) {
        if let Ok(mut health) = self.health.lock() {
            f(&mut health);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SourceKind;
    use crate::signal::join_with_timeout;

    fn solid(value: u8, seq: u64) -> Frame {
        Frame::new(vec![value; 8 * 8 * 3], 8, 8, seq).unwrap()
    }

    #[test]
    fn fixed_skip_admits_every_nth_frame() {
        let mut skipper = SkipController::new(3, false);
        let admitted: Vec<bool> = (1..=7).map(|i| skipper.admit(&solid(0, i))).collect();
        assert_eq!(admitted, vec![true, false, false, true, false, false, true]);
    }

    #[test]
    fn adaptive_skip_grows_when_static_and_shrinks_on_motion() {
        let mut skipper = SkipController::new(1, true);
        for i in 0..15 {
            skipper.admit(&solid(10, i));
        }
        assert_eq!(skipper.skip(), MAX_ADAPTIVE_SKIP);
        skipper.admit(&solid(200, 16));
        assert_eq!(skipper.skip(), MAX_ADAPTIVE_SKIP - 1);
    }

    #[test]
    fn cache_slots_are_per_instance() {
        let a = FrameCache::new();
        let b = FrameCache::new();
        a.slot(1).store(solid(1, 1));
        assert!(a.latest(1).is_some());
        assert!(b.latest(1).is_none());
        assert!(a.fresh(1, Duration::from_secs(2)).is_some());
    }

    type Harness = (
        CaptureWorker,
        Arc<CaptureControl>,
        Arc<FrameQueue<Frame>>,
        SharedHealth,
        CacheSlot,
    );

    fn worker_for(uri: &str, settings: CaptureSettings) -> Harness {
        let spec = SourceSpec::new(uri, SourceKind::Rtsp);
        let control = Arc::new(CaptureControl::new(spec, vec![Backend::Ffmpeg], &settings));
        let queue = Arc::new(FrameQueue::new(2));
        let health = Arc::new(Mutex::new(CaptureHealth::new(1)));
        let cache = CacheSlot::default();
        let worker = CaptureWorker::new(
            1,
            settings,
            control.clone(),
            queue.clone(),
            cache.clone(),
            health.clone(),
        );
        (worker, control, queue, health, cache)
    }

    #[test]
    fn worker_feeds_queue_and_cache_until_stopped() -> anyhow::Result<()> {
        let (worker, control, queue, health, cache) =
            worker_for("stub://lobby?fps=200", CaptureSettings::default());
        let spec = SourceSpec::new("stub://lobby?fps=200", SourceKind::Rtsp);
        let source = open_capture(&spec, &[Backend::Ffmpeg])?;
        let handle = worker.spawn(source)?;

        let frame = queue.pop_latest_timeout(Duration::from_secs(2));
        assert!(frame.is_some());
        assert!(cache.latest().is_some());

        control.stop_signal().stop();
        let result = join_with_timeout(handle, Duration::from_secs(2), "capture")?;
        assert!(result.is_ok());
        let health = health.lock().map(|h| h.clone()).unwrap();
        assert!(health.frames_captured > 0);
        assert!(!health.online);
        Ok(())
    }

    #[test]
    fn exhausted_stream_ends_with_connect_failed() -> anyhow::Result<()> {
        let settings = CaptureSettings {
            max_restarts: 2,
            restart_backoff_base: Duration::from_millis(1),
            restart_backoff_max: Duration::from_millis(2),
            read_timeout: Duration::from_millis(20),
            ..CaptureSettings::default()
        };
        let (worker, control, _queue, health, _cache) =
            worker_for("stub://gate?frames=2", settings);
        let spec = SourceSpec::new("stub://gate?frames=2", SourceKind::Rtsp);
        let source = open_capture(&spec, &[Backend::Ffmpeg])?;
        control.set_source(
            SourceSpec::new("stub://gate?fail=connect_timeout", SourceKind::Rtsp),
            vec![Backend::Ffmpeg],
        );
        let handle = worker.spawn(source)?;
        let result = join_with_timeout(handle, Duration::from_secs(5), "capture")?;
        assert_eq!(result, Err(CaptureError::ConnectFailed { attempts: 2 }));
        let health = health.lock().map(|h| h.clone()).unwrap();
        assert_eq!(health.frames_captured, 2);
        Ok(())
    }
}
