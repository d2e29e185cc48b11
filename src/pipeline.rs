//! One camera's running capture + processing pair.
//!
//! The capture thread fills a drop-oldest `FrameQueue`; the processing thread takes
//! only the newest frame, runs detection, tracking and counting, and publishes
//! crossing events. A slow detector therefore drops frames instead of stalling the
//! camera. Encoded frames are produced for `frames()` streams only while at least one
//! client is attached.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::capture::{
    CacheSlot, CaptureControl, CaptureHealth, CaptureSettings, CaptureWorker, SharedHealth,
};
use crate::config::{CameraConfig, CrosslineConfig, SourceDefaults};
use crate::detect::{Detector, DetectorRegistry, Embedder, ObjectClass};
use crate::frame::{laplacian_variance, Frame, FrameQueue, DEFAULT_JPEG_QUALITY};
use crate::ingest::{CaptureError, FrameSource};
use crate::overlay::{Overlay, TrackBox};
use crate::signal::{join_with_timeout, StopSignal};
use crate::track::{
    Counts, CrossingConfig, CrossingEvent, EventKind, EventSink, LineCounter, Observation,
    Tracker, TrackerConfig,
};
use crate::watchdog::Heartbeat;
use crate::CameraId;

const POP_TIMEOUT: Duration = Duration::from_millis(200);

/// Builds a fresh embedder per pipeline.
pub type EmbedderFactory = Arc<dyn Fn() -> Box<dyn Embedder> + Send + Sync>;

/// Settings shared by every camera's processing stage.
#[derive(Clone, Debug)]
pub struct ProcessingSettings {
    pub min_confidence: f32,
    pub detector: Option<String>,
    pub tracker: TrackerConfig,
    pub crossing: CrossingConfig,
    pub queue_capacity: usize,
    pub jpeg_quality: u8,
    /// Draw line, tracks and counts on streamed frames.
    pub overlay: bool,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            detector: None,
            tracker: TrackerConfig::default(),
            crossing: CrossingConfig::default(),
            queue_capacity: 2,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            overlay: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Frame processing
// ----------------------------------------------------------------------------

/// Logs the first failure of a streak and the recovery, nothing in between.
#[derive(Debug, Default)]
struct ErrorStreak {
    failing: bool,
}

impl ErrorStreak {
    fn fail(&mut self, camera_id: CameraId, what: &str, err: &dyn std::fmt::Display) {
        if !self.failing {
            log::error!("process[{}]: {} failed: {}", camera_id, what, err);
            self.failing = true;
        }
    }

    fn ok(&mut self, camera_id: CameraId) {
        if self.failing {
            log::info!("process[{}]: recovered", camera_id);
            self.failing = false;
        }
    }
}

/// Detection → tracking → counting for one camera. Owned by the processing thread.
pub struct FrameProcessor {
    camera_id: CameraId,
    detector: Box<dyn Detector>,
    embedder: Option<Box<dyn Embedder>>,
    tracker: Tracker,
    counter: LineCounter,
    counting: Vec<ObjectClass>,
    min_confidence: f32,
    jpeg_quality: u8,
    sink: Arc<dyn EventSink>,
    best_crops: HashMap<u64, Frame>,
    detect_errors: ErrorStreak,
}

impl FrameProcessor {
    pub fn new(
        camera: &CameraConfig,
        settings: &ProcessingSettings,
        detector: Box<dyn Detector>,
        embedder: Option<Box<dyn Embedder>>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let mut tracker_config = settings.tracker.clone();
        tracker_config.line = camera.line;
        tracker_config.zone_classes = if camera.face_tracking {
            vec![ObjectClass::Face]
        } else {
            Vec::new()
        };
        Self {
            camera_id: camera.id,
            detector,
            embedder,
            tracker: Tracker::new(camera.id, tracker_config),
            counter: LineCounter::new(camera.line, settings.crossing),
            counting: camera.counting.clone(),
            min_confidence: settings.min_confidence,
            jpeg_quality: settings.jpeg_quality,
            sink,
            best_crops: HashMap::new(),
            detect_errors: ErrorStreak::default(),
        }
    }

    /// Applies a camera's refreshed line/counting settings.
    pub fn reconfigure(&mut self, camera: &CameraConfig) {
        self.tracker.set_line(camera.line);
        self.counter.set_line(camera.line);
        self.counting = camera.counting.clone();
    }

    pub fn counts(&self, class: ObjectClass) -> Counts {
        if class == ObjectClass::Face {
            self.tracker.counts()
        } else {
            self.counter.counts(class)
        }
    }

    /// Current line, live tracks and totals for `classes`.
    pub fn overlay(&self, classes: &[ObjectClass]) -> Overlay {
        let mut tracks: Vec<TrackBox> = self
            .tracker
            .tracks()
            .map(|track| TrackBox {
                id: track.id,
                class: track.class,
                bbox: track.bbox,
            })
            .collect();
        tracks.sort_by_key(|track| track.id);
        Overlay {
            line: self.tracker.config().line,
            tracks,
            counts: classes
                .iter()
                .map(|class| (*class, self.counts(*class)))
                .collect(),
        }
    }

    /// Runs one frame. Detector failures count as an empty frame.
    pub fn process(&mut self, frame: &Frame) -> Result<Vec<CrossingEvent>> {
        let detections = match self.detector.detect(frame, self.min_confidence) {
            Ok(detections) => {
                self.detect_errors.ok(self.camera_id);
                detections
            }
            Err(err) => {
                self.detect_errors.fail(self.camera_id, "detect", &err);
                Vec::new()
            }
        };

        let mut observations = Vec::with_capacity(detections.len());
        let mut crops = Vec::with_capacity(detections.len());
        for detection in detections {
            let (x, y, w, h) = detection.bbox.to_rect();
            let crop = frame.crop(x, y, w, h);
            let mut observation = Observation::new(detection);
            if let Some(crop) = &crop {
                observation.sharpness =
                    laplacian_variance(&crop.to_gray(), crop.width, crop.height);
                if let Some(embedder) = self.embedder.as_mut() {
                    match embedder.embed(crop) {
                        Ok(embedding) => observation.embedding = embedding,
                        Err(err) => {
                            log::debug!("process[{}]: embed failed: {}", self.camera_id, err)
                        }
                    }
                }
            }
            observations.push(observation);
            crops.push(crop);
        }

        let now = unix_seconds(frame.wall_clock);
        let outcome = self
            .tracker
            .update(&observations, frame.width, frame.height, now);

        // Updates come back in observation order, minus the filtered ones.
        let mut crop_iter = observations.iter().zip(crops);
        for update in &outcome.updates {
            let crop = crop_iter
                .by_ref()
                .find(|(observation, _)| observation.detection.bbox == update.bbox)
                .and_then(|(_, crop)| crop);
            if update.best_improved {
                if let Some(crop) = crop {
                    self.best_crops.insert(update.track_id, crop);
                }
            }
        }

        let mut events = outcome.events;
        for update in &outcome.updates {
            if !self.counting.contains(&update.class) {
                continue;
            }
            let Some(direction) = self.counter.update(
                update.track_id,
                update.class,
                &update.bbox,
                frame.width,
                frame.height,
                now,
            ) else {
                continue;
            };
            let Some(kind) = EventKind::for_crossing(update.class, direction) else {
                continue;
            };
            let track = self.tracker.track(update.track_id);
            events.push(CrossingEvent {
                timestamp: now as u64,
                camera_id: self.camera_id,
                track_id: update.track_id,
                kind,
                direction,
                class: update.class,
                identity: track.and_then(|t| t.identity.clone()),
                temp_id: track.and_then(|t| t.temp_id.clone()),
                score: update.quality,
                snapshot_ref: update.snapshot_ref.clone(),
            });
        }

        let idle = self.tracker.config().idle_secs;
        self.counter.prune(now, idle);
        let tracker = &self.tracker;
        self.best_crops.retain(|id, _| tracker.track(*id).is_some());

        for event in &events {
            self.store_snapshot(event);
            if let Err(err) = self.sink.publish(event) {
                log::warn!("process[{}]: event sink failed: {}", self.camera_id, err);
            }
        }
        Ok(events)
    }

    fn store_snapshot(&self, event: &CrossingEvent) {
        let (Some(path), Some(crop)) = (&event.snapshot_ref, self.best_crops.get(&event.track_id))
        else {
            return;
        };
        if let Err(err) = write_jpeg(Path::new(path), crop, self.jpeg_quality) {
            log::warn!("process[{}]: snapshot {} not written: {}", self.camera_id, path, err);
        }
    }
}

fn write_jpeg(path: &Path, frame: &Frame, quality: u8) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create snapshot dir {}", dir.display()))?;
    }
    let jpeg = frame.encode_jpeg(quality)?;
    std::fs::write(path, jpeg).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn unix_seconds(at: SystemTime) -> f64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Everything needed to turn an opened source into a running pipeline.
#[derive(Clone)]
pub struct PipelineFactory {
    pub registry: DetectorRegistry,
    pub embedder: Option<EmbedderFactory>,
    pub sink: Arc<dyn EventSink>,
    pub defaults: SourceDefaults,
    pub capture: CaptureSettings,
    pub processing: ProcessingSettings,
}

impl PipelineFactory {
    pub fn from_config(config: &CrosslineConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            registry: DetectorRegistry::with_builtin(),
            embedder: None,
            sink,
            defaults: config.source.clone(),
            capture: config.capture.clone(),
            processing: ProcessingSettings {
                min_confidence: config.detection.min_confidence,
                detector: config.detection.detector.clone(),
                tracker: config.tracker.clone(),
                crossing: config.crossing,
                queue_capacity: config.queue_capacity,
                jpeg_quality: config.snapshot.jpeg_quality,
                overlay: config.snapshot.stream_overlay,
            },
        }
    }

    pub fn with_embedder(mut self, embedder: EmbedderFactory) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn launch(
        &self,
        camera: &CameraConfig,
        source: FrameSource,
        cache: CacheSlot,
    ) -> Result<Pipeline> {
        let name = camera
            .detector
            .as_deref()
            .or(self.processing.detector.as_deref());
        let mut detector = self.registry.build(name)?;
        detector
            .warm_up()
            .with_context(|| format!("warm up detector {}", detector.name()))?;
        let embedder = self.embedder.as_ref().map(|factory| factory());
        let processor = FrameProcessor::new(
            camera,
            &self.processing,
            detector,
            embedder,
            self.sink.clone(),
        );
        Pipeline::launch(
            camera,
            &self.defaults,
            &self.capture,
            &self.processing,
            processor,
            source,
            cache,
        )
    }
}

// ----------------------------------------------------------------------------
// Encoded frame stream
// ----------------------------------------------------------------------------

#[derive(Default)]
struct LatestJpeg {
    state: Mutex<(u64, Option<Arc<Vec<u8>>>)>,
    cvar: Condvar,
}

impl LatestJpeg {
    fn publish(&self, jpeg: Vec<u8>) {
        if let Ok(mut state) = self.state.lock() {
            state.0 += 1;
            state.1 = Some(Arc::new(jpeg));
        }
        self.cvar.notify_all();
    }

    fn wait_newer(&self, seen: u64, timeout: Duration) -> Option<(u64, Arc<Vec<u8>>)> {
        let state = self.state.lock().ok()?;
        let (state, _) = self
            .cvar
            .wait_timeout_while(state, timeout, |state| state.0 <= seen)
            .ok()?;
        match &state.1 {
            Some(jpeg) if state.0 > seen => Some((state.0, jpeg.clone())),
            _ => None,
        }
    }
}

/// Iterator of JPEG-encoded frames. Counts as an attached client until dropped and
/// ends when the pipeline stops.
pub struct FrameStream {
    latest: Arc<LatestJpeg>,
    clients: Arc<AtomicUsize>,
    stop: StopSignal,
    seen: u64,
}

impl Iterator for FrameStream {
    type Item = Arc<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.stop.is_stopped() {
            if let Some((seq, jpeg)) = self.latest.wait_newer(self.seen, POP_TIMEOUT) {
                self.seen = seq;
                return Some(jpeg);
            }
        }
        None
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.clients.fetch_sub(1, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

pub struct Pipeline {
    camera_id: CameraId,
    control: Arc<CaptureControl>,
    stop: StopSignal,
    health: SharedHealth,
    heartbeat: Heartbeat,
    clients: Arc<AtomicUsize>,
    latest: Arc<LatestJpeg>,
    counts: Arc<Mutex<HashMap<ObjectClass, Counts>>>,
    pending: Arc<Mutex<Option<CameraConfig>>>,
    capture: Option<JoinHandle<Result<(), CaptureError>>>,
    process: Option<JoinHandle<()>>,
    exit: Option<Result<(), CaptureError>>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn launch(
        camera: &CameraConfig,
        defaults: &SourceDefaults,
        capture: &CaptureSettings,
        settings: &ProcessingSettings,
        processor: FrameProcessor,
        source: FrameSource,
        cache: CacheSlot,
    ) -> Result<Self> {
        let capture_settings = camera.capture_settings(capture);
        let control = Arc::new(CaptureControl::new(
            camera.source_spec(defaults),
            camera.priority(defaults),
            &capture_settings,
        ));
        let stop = control.stop_signal();
        let queue = Arc::new(FrameQueue::new(settings.queue_capacity));
        let health = Arc::new(Mutex::new(CaptureHealth::new(camera.id)));
        let heartbeat = Heartbeat::new();
        let clients = Arc::new(AtomicUsize::new(0));
        let latest = Arc::new(LatestJpeg::default());
        let counts = Arc::new(Mutex::new(HashMap::new()));
        let pending = Arc::new(Mutex::new(None));

        let worker = CaptureWorker::new(
            camera.id,
            capture_settings,
            control.clone(),
            queue.clone(),
            cache,
            health.clone(),
        );
        let capture_handle = worker
            .spawn(source)
            .context("spawn capture thread")?;

        let process_loop = ProcessLoop {
            camera_id: camera.id,
            processor,
            queue,
            stop: stop.clone(),
            heartbeat: heartbeat.clone(),
            clients: clients.clone(),
            latest: latest.clone(),
            counts: counts.clone(),
            pending: pending.clone(),
            counted: camera.counting.clone(),
            jpeg_quality: settings.jpeg_quality,
            overlay: settings.overlay,
        };
        let process_handle = match std::thread::Builder::new()
            .name(format!("process-{}", camera.id))
            .spawn(move || process_loop.run())
        {
            Ok(handle) => handle,
            Err(err) => {
                stop.stop();
                let _ = join_with_timeout(capture_handle, Duration::from_secs(2), "capture");
                return Err(anyhow!("spawn process thread: {}", err));
            }
        };

        log::info!("pipeline[{}]: started ({})", camera.id, camera.name);
        Ok(Self {
            camera_id: camera.id,
            control,
            stop,
            health,
            heartbeat,
            clients,
            latest,
            counts,
            pending,
            capture: Some(capture_handle),
            process: Some(process_handle),
            exit: None,
        })
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    /// False once the capture thread has exited or stop was requested.
    pub fn is_running(&self) -> bool {
        !self.stop.is_stopped()
            && self
                .capture
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    /// Capture thread result, once it has exited. Reaps the thread.
    pub fn exit_status(&mut self) -> Option<Result<(), CaptureError>> {
        if self.exit.is_none() {
            let finished = self
                .capture
                .as_ref()
                .is_some_and(|handle| handle.is_finished());
            if finished {
                if let Some(handle) = self.capture.take() {
                    self.exit = Some(handle.join().unwrap_or_else(|_| {
                        Err(CaptureError::Launch("capture panicked".into()))
                    }));
                }
            }
        }
        self.exit.clone()
    }

    pub fn health(&self) -> CaptureHealth {
        self.health
            .lock()
            .map(|health| health.clone())
            .unwrap_or_else(|_| CaptureHealth::new(self.camera_id))
    }

    pub fn heartbeat(&self) -> Heartbeat {
        self.heartbeat.clone()
    }

    pub fn counts(&self, class: ObjectClass) -> Counts {
        self.counts
            .lock()
            .ok()
            .and_then(|counts| counts.get(&class).copied())
            .unwrap_or_default()
    }

    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Stream of JPEG frames; encoding only happens while a stream is attached.
    pub fn frames(&self) -> FrameStream {
        self.clients.fetch_add(1, Ordering::SeqCst);
        let seen = self
            .latest
            .state
            .lock()
            .map(|state| state.0)
            .unwrap_or_default();
        FrameStream {
            latest: self.latest.clone(),
            clients: self.clients.clone(),
            stop: self.stop.clone(),
            seen,
        }
    }

    /// Pushes new camera settings into the running stages and reopens the source.
    pub fn refresh(&self, camera: &CameraConfig, defaults: &SourceDefaults) {
        self.control.set_skip(camera.frame_skip, camera.adaptive_skip);
        self.control
            .set_source(camera.source_spec(defaults), camera.priority(defaults));
        if let Ok(mut pending) = self.pending.lock() {
            *pending = Some(camera.clone());
        }
        self.control.request_restart();
        log::info!("pipeline[{}]: flags refreshed", self.camera_id);
    }

    pub fn request_restart(&self) {
        self.control.request_restart();
    }

    /// Stops both threads, waiting at most `timeout` for each.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        self.stop.stop();
        let mut errors = Vec::new();
        if let Some(handle) = self.capture.take() {
            match join_with_timeout(handle, timeout, "capture") {
                Ok(result) => self.exit = Some(result),
                Err(err) => errors.push(err.to_string()),
            }
        }
        if let Some(handle) = self.process.take() {
            if let Err(err) = join_with_timeout(handle, timeout, "process") {
                errors.push(err.to_string());
            }
        }
        log::info!("pipeline[{}]: stopped", self.camera_id);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("pipeline {}: {}", self.camera_id, errors.join("; ")))
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

struct ProcessLoop {
    camera_id: CameraId,
    processor: FrameProcessor,
    queue: Arc<FrameQueue<Frame>>,
    stop: StopSignal,
    heartbeat: Heartbeat,
    clients: Arc<AtomicUsize>,
    latest: Arc<LatestJpeg>,
    counts: Arc<Mutex<HashMap<ObjectClass, Counts>>>,
    pending: Arc<Mutex<Option<CameraConfig>>>,
    counted: Vec<ObjectClass>,
    jpeg_quality: u8,
    overlay: bool,
}

impl ProcessLoop {
    fn run(mut self) {
        let mut errors = ErrorStreak::default();
        while !self.stop.is_stopped() {
            if let Some(camera) = self.pending.lock().ok().and_then(|mut p| p.take()) {
                self.processor.reconfigure(&camera);
                self.counted = camera.counting.clone();
            }
            let Some(frame) = self.queue.pop_latest_timeout(POP_TIMEOUT) else {
                continue;
            };

            let processor = &mut self.processor;
            match catch_unwind(AssertUnwindSafe(|| processor.process(&frame))) {
                Ok(Ok(_)) => errors.ok(self.camera_id),
                Ok(Err(err)) => errors.fail(self.camera_id, "frame", &err),
                Err(_) => errors.fail(self.camera_id, "frame", &"panic in processing stage"),
            }
            self.heartbeat.beat();
            self.publish_counts();

            if self.clients.load(Ordering::SeqCst) > 0 {
                match self.stream_jpeg(&frame) {
                    Ok(jpeg) => self.latest.publish(jpeg),
                    Err(err) => errors.fail(self.camera_id, "encode", &err),
                }
            }
        }
    }

    fn stream_jpeg(&self, frame: &Frame) -> Result<Vec<u8>> {
        if !self.overlay {
            return frame.encode_jpeg(self.jpeg_quality);
        }
        self.processor
            .overlay(&self.counted)
            .render(frame)?
            .encode_jpeg(self.jpeg_quality)
    }

    fn publish_counts(&self) {
        let mut classes = self.counted.clone();
        classes.push(ObjectClass::Face);
        if let Ok(mut counts) = self.counts.lock() {
            for class in classes {
                counts.insert(class, self.processor.counts(class));
            }
        }
    }
}
