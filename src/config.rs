use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::capture::{CaptureSettings, DEFAULT_MAX_READ_FAILURES, DEFAULT_MAX_RESTARTS};
use crate::detect::ObjectClass;
use crate::frame::{DEFAULT_JPEG_QUALITY, MAX_SNAPSHOT_HEIGHT, MAX_SNAPSHOT_WIDTH};
use crate::ingest::{Backend, SourceKind, SourceSpec, Transport};
use crate::manager::{
    BreakerPolicy, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_BREAKER_OPEN,
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_JITTER,
};
use crate::track::{
    CrossingConfig, LineConfig, Orientation, QualityWeights, TrackerConfig,
    DEFAULT_COUNT_COOLDOWN_SECS, DEFAULT_IOU_THRESHOLD, DEFAULT_SHARPNESS_SCALE,
    DEFAULT_SIMILARITY_THRESHOLD, DEFAULT_TRACK_IDLE_SECS,
};
use crate::watchdog::{WatchdogSettings, DEFAULT_STALE_AFTER, DEFAULT_WATCHDOG_INTERVAL};
use crate::CameraId;

const DEFAULT_SNAPSHOT_DIR: &str = "snapshots";
const DEFAULT_QUEUE_CAPACITY: usize = 2;
const DEFAULT_RW_TIMEOUT_US: u64 = 5_000_000;
const DEFAULT_STIMEOUT_US: u64 = 5_000_000;
const DEFAULT_LATENCY_MS: u32 = 100;
const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
const DEFAULT_SNAPSHOT_CACHE_AGE: Duration = Duration::from_secs(2);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize, Default)]
struct CrosslineConfigFile {
    storage: Option<StorageConfigFile>,
    ingest: Option<IngestConfigFile>,
    breaker: Option<BreakerConfigFile>,
    tracker: Option<TrackerConfigFile>,
    crossing: Option<CrossingConfigFile>,
    watchdog: Option<WatchdogConfigFile>,
    snapshot: Option<SnapshotConfigFile>,
    detection: Option<DetectionConfigFile>,
    cameras: Option<Vec<CameraConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    status_db: Option<String>,
    events_db: Option<String>,
    snapshot_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct IngestConfigFile {
    backend_priority: Option<Vec<String>>,
    rw_timeout_us: Option<u64>,
    stimeout_us: Option<u64>,
    extra_flags: Option<Vec<String>>,
    queue_capacity: Option<usize>,
    max_read_failures: Option<u32>,
    max_restarts: Option<u32>,
    read_timeout_ms: Option<u64>,
    restart_backoff_base_ms: Option<u64>,
    restart_backoff_max_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct BreakerConfigFile {
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    jitter: Option<f64>,
    open_secs: Option<u64>,
    failure_threshold: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    iou_threshold: Option<f32>,
    similarity_threshold: Option<f32>,
    count_cooldown_secs: Option<f64>,
    idle_secs: Option<f64>,
    quality_weights: Option<QualityWeights>,
    sharpness_scale: Option<f64>,
    min_size: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct CrossingConfigFile {
    hysteresis_px: Option<f32>,
    min_travel_px: Option<f32>,
    min_frames: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct WatchdogConfigFile {
    interval_secs: Option<u64>,
    stale_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SnapshotConfigFile {
    cache_max_age_ms: Option<u64>,
    max_width: Option<u32>,
    max_height: Option<u32>,
    jpeg_quality: Option<u8>,
    probe_timeout_ms: Option<u64>,
    stream_overlay: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    detector: Option<String>,
    min_confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    id: CameraId,
    uri: String,
    name: Option<String>,
    kind: Option<SourceKind>,
    transport: Option<Transport>,
    backend_priority: Option<Vec<String>>,
    width: Option<u32>,
    height: Option<u32>,
    latency_ms: Option<u32>,
    frame_skip: Option<u32>,
    adaptive_skip: Option<bool>,
    max_read_failures: Option<u32>,
    enabled: Option<bool>,
    line: Option<LineConfigFile>,
    counting: Option<Vec<ObjectClass>>,
    face_tracking: Option<bool>,
    detector: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LineConfigFile {
    orientation: Option<Orientation>,
    ratio: Option<f32>,
    reverse: Option<bool>,
}

/// Process-wide source defaults applied to every camera.
#[derive(Debug, Clone)]
pub struct SourceDefaults {
    pub backend_priority: Vec<Backend>,
    pub rw_timeout_us: u64,
    pub stimeout_us: u64,
    pub extra_flags: Vec<String>,
}

impl Default for SourceDefaults {
    fn default() -> Self {
        Self {
            backend_priority: Vec::new(),
            rw_timeout_us: DEFAULT_RW_TIMEOUT_US,
            stimeout_us: DEFAULT_STIMEOUT_US,
            extra_flags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub cache_max_age: Duration,
    pub max_width: u32,
    pub max_height: u32,
    pub jpeg_quality: u8,
    pub probe_timeout: Duration,
    /// Annotate frames handed to live stream clients.
    pub stream_overlay: bool,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            cache_max_age: DEFAULT_SNAPSHOT_CACHE_AGE,
            max_width: MAX_SNAPSHOT_WIDTH,
            max_height: MAX_SNAPSHOT_HEIGHT,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            stream_overlay: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    /// Registry name; `None` uses the registry default.
    pub detector: Option<String>,
    pub min_confidence: f32,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            detector: None,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub id: CameraId,
    pub name: String,
    pub kind: SourceKind,
    pub uri: String,
    pub transport: Transport,
    /// Overrides the process-wide priority list.
    pub backend_priority: Option<Vec<Backend>>,
    pub width: u32,
    pub height: u32,
    pub latency_ms: u32,
    pub frame_skip: u32,
    pub adaptive_skip: bool,
    pub max_read_failures: Option<u32>,
    pub enabled: bool,
    pub line: LineConfig,
    /// Classes counted by the line counter.
    pub counting: Vec<ObjectClass>,
    /// Emit face in/out events from tracker zone changes.
    pub face_tracking: bool,
    pub detector: Option<String>,
}

impl CameraConfig {
    pub fn new(id: CameraId, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        Self {
            id,
            name: format!("camera-{}", id),
            kind: infer_kind(&uri),
            uri,
            transport: Transport::Tcp,
            backend_priority: None,
            width: 0,
            height: 0,
            latency_ms: DEFAULT_LATENCY_MS,
            frame_skip: 1,
            adaptive_skip: false,
            max_read_failures: None,
            enabled: true,
            line: LineConfig::default(),
            counting: vec![ObjectClass::Person],
            face_tracking: false,
            detector: None,
        }
    }

    pub fn source_spec(&self, defaults: &SourceDefaults) -> SourceSpec {
        let mut spec = SourceSpec::new(self.uri.clone(), self.kind).with_transport(self.transport);
        spec.width = self.width;
        spec.height = self.height;
        spec.latency_ms = self.latency_ms;
        spec.rw_timeout_us = defaults.rw_timeout_us;
        spec.stimeout_us = defaults.stimeout_us;
        spec.extra_flags = defaults.extra_flags.clone();
        spec
    }

    pub fn priority(&self, defaults: &SourceDefaults) -> Vec<Backend> {
        self.backend_priority
            .clone()
            .unwrap_or_else(|| defaults.backend_priority.clone())
    }

    pub fn capture_settings(&self, base: &CaptureSettings) -> CaptureSettings {
        CaptureSettings {
            max_read_failures: self.max_read_failures.unwrap_or(base.max_read_failures),
            frame_skip: self.frame_skip.max(1),
            adaptive_skip: self.adaptive_skip,
            ..base.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrosslineConfig {
    pub status_db: Option<String>,
    pub events_db: Option<String>,
    pub snapshot_dir: PathBuf,
    pub source: SourceDefaults,
    pub queue_capacity: usize,
    pub capture: CaptureSettings,
    pub breaker: BreakerPolicy,
    pub tracker: TrackerConfig,
    pub crossing: CrossingConfig,
    pub watchdog: WatchdogSettings,
    pub snapshot: SnapshotSettings,
    pub detection: DetectionSettings,
    pub cameras: Vec<CameraConfig>,
}

impl Default for CrosslineConfig {
    fn default() -> Self {
        // An empty file yields the documented defaults.
        Self::from_file(CrosslineConfigFile::default()).unwrap_or_else(|_| Self {
            status_db: None,
            events_db: None,
            snapshot_dir: PathBuf::from(DEFAULT_SNAPSHOT_DIR),
            source: SourceDefaults::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            capture: CaptureSettings::default(),
            breaker: BreakerPolicy::default(),
            tracker: TrackerConfig::default(),
            crossing: CrossingConfig::default(),
            watchdog: WatchdogSettings::default(),
            snapshot: SnapshotSettings::default(),
            detection: DetectionSettings::default(),
            cameras: Vec::new(),
        })
    }
}

impl CrosslineConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CROSSLINE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CrosslineConfigFile) -> Result<Self> {
        let storage = file.storage.unwrap_or_default();
        let ingest = file.ingest.unwrap_or_default();
        let breaker = file.breaker.unwrap_or_default();
        let tracker = file.tracker.unwrap_or_default();
        let crossing = file.crossing.unwrap_or_default();
        let watchdog = file.watchdog.unwrap_or_default();
        let snapshot = file.snapshot.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();

        let snapshot_dir = storage
            .snapshot_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR));
        let source = SourceDefaults {
            backend_priority: match ingest.backend_priority {
                Some(names) => parse_backends(&names)?,
                None => Vec::new(),
            },
            rw_timeout_us: ingest.rw_timeout_us.unwrap_or(DEFAULT_RW_TIMEOUT_US),
            stimeout_us: ingest.stimeout_us.unwrap_or(DEFAULT_STIMEOUT_US),
            extra_flags: ingest.extra_flags.unwrap_or_default(),
        };
        let capture_defaults = CaptureSettings::default();
        let capture = CaptureSettings {
            max_read_failures: ingest
                .max_read_failures
                .unwrap_or(DEFAULT_MAX_READ_FAILURES),
            max_restarts: ingest.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS),
            read_timeout: ingest
                .read_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(capture_defaults.read_timeout),
            restart_backoff_base: ingest
                .restart_backoff_base_ms
                .map(Duration::from_millis)
                .unwrap_or(capture_defaults.restart_backoff_base),
            restart_backoff_max: ingest
                .restart_backoff_max_ms
                .map(Duration::from_millis)
                .unwrap_or(capture_defaults.restart_backoff_max),
            ..capture_defaults
        };
        let breaker = BreakerPolicy {
            backoff_base: breaker
                .backoff_base_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_BACKOFF_BASE),
            backoff_max: breaker
                .backoff_max_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_BACKOFF_MAX),
            jitter: breaker.jitter.unwrap_or(DEFAULT_JITTER),
            open_for: breaker
                .open_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_BREAKER_OPEN),
            failure_threshold: breaker.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD),
        };
        let tracker = TrackerConfig {
            iou_threshold: tracker.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
            similarity_threshold: tracker
                .similarity_threshold
                .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD),
            cooldown_secs: tracker
                .count_cooldown_secs
                .unwrap_or(DEFAULT_COUNT_COOLDOWN_SECS),
            idle_secs: tracker.idle_secs.unwrap_or(DEFAULT_TRACK_IDLE_SECS),
            weights: tracker.quality_weights.unwrap_or_default(),
            sharpness_scale: tracker.sharpness_scale.unwrap_or(DEFAULT_SHARPNESS_SCALE),
            min_size: tracker.min_size.unwrap_or(0.0),
            snapshot_dir: snapshot_dir.clone(),
            ..TrackerConfig::default()
        };
        let crossing_defaults = CrossingConfig::default();
        let crossing = CrossingConfig {
            hysteresis_px: crossing
                .hysteresis_px
                .unwrap_or(crossing_defaults.hysteresis_px),
            min_travel_px: crossing
                .min_travel_px
                .unwrap_or(crossing_defaults.min_travel_px),
            min_frames: crossing.min_frames.unwrap_or(crossing_defaults.min_frames),
            cooldown_secs: tracker.cooldown_secs,
        };
        let watchdog = WatchdogSettings {
            interval: watchdog
                .interval_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_WATCHDOG_INTERVAL),
            stale_after: watchdog
                .stale_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_STALE_AFTER),
        };
        let snapshot = SnapshotSettings {
            cache_max_age: snapshot
                .cache_max_age_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SNAPSHOT_CACHE_AGE),
            max_width: snapshot.max_width.unwrap_or(MAX_SNAPSHOT_WIDTH),
            max_height: snapshot.max_height.unwrap_or(MAX_SNAPSHOT_HEIGHT),
            jpeg_quality: snapshot.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            probe_timeout: snapshot
                .probe_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_PROBE_TIMEOUT),
            stream_overlay: snapshot.stream_overlay.unwrap_or(true),
        };
        let detection = DetectionSettings {
            detector: detection.detector,
            min_confidence: detection.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE),
        };
        let cameras = file
            .cameras
            .unwrap_or_default()
            .into_iter()
            .map(camera_from_file)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            status_db: storage.status_db,
            events_db: storage.events_db,
            snapshot_dir,
            source,
            queue_capacity: ingest.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            capture,
            breaker,
            tracker,
            crossing,
            watchdog,
            snapshot,
            detection,
            cameras,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("CROSSLINE_STATUS_DB") {
            if !path.trim().is_empty() {
                self.status_db = Some(path);
            }
        }
        if let Ok(path) = std::env::var("CROSSLINE_EVENTS_DB") {
            if !path.trim().is_empty() {
                self.events_db = Some(path);
            }
        }
        if let Ok(dir) = std::env::var("CROSSLINE_SNAPSHOT_DIR") {
            if !dir.trim().is_empty() {
                self.snapshot_dir = PathBuf::from(&dir);
                self.tracker.snapshot_dir = PathBuf::from(dir);
            }
        }
        if let Ok(priority) = std::env::var("CROSSLINE_BACKEND_PRIORITY") {
            let parsed = split_csv(&priority);
            if !parsed.is_empty() {
                self.source.backend_priority = parse_backends(&parsed)?;
            }
        }
        if let Ok(value) = std::env::var("RTSP_RW_TIMEOUT_USEC") {
            self.source.rw_timeout_us = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("RTSP_RW_TIMEOUT_USEC must be an integer"))?;
        }
        if let Ok(value) = std::env::var("RTSP_STIMEOUT_USEC") {
            self.source.stimeout_us = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("RTSP_STIMEOUT_USEC must be an integer"))?;
        }
        if let Ok(flags) = std::env::var("FFMPEG_EXTRA_FLAGS") {
            self.source.extra_flags = flags.split_whitespace().map(str::to_string).collect();
        }
        if let Ok(stale) = std::env::var("CROSSLINE_WATCHDOG_STALE_SECS") {
            let seconds: u64 = stale.trim().parse().map_err(|_| {
                anyhow!("CROSSLINE_WATCHDOG_STALE_SECS must be an integer number of seconds")
            })?;
            self.watchdog.stale_after = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let mut seen = HashSet::new();
        for camera in &mut self.cameras {
            if !seen.insert(camera.id) {
                return Err(anyhow!("duplicate camera id {}", camera.id));
            }
            if camera.uri.trim().is_empty() {
                return Err(anyhow!("camera {} has an empty uri", camera.id));
            }
            check_unit("line.ratio", camera.line.ratio)?;
            camera.frame_skip = camera.frame_skip.max(1);
        }
        check_unit("tracker.iou_threshold", self.tracker.iou_threshold)?;
        check_unit("tracker.similarity_threshold", self.tracker.similarity_threshold)?;
        check_unit("detection.min_confidence", self.detection.min_confidence)?;
        if self.tracker.cooldown_secs < 0.0 || self.tracker.idle_secs <= 0.0 {
            return Err(anyhow!("tracker cooldown must be >= 0 and idle timeout > 0"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("ingest.queue_capacity must be at least 1"));
        }
        if self.watchdog.interval.is_zero() || self.watchdog.stale_after.is_zero() {
            return Err(anyhow!("watchdog interval and stale threshold must be non-zero"));
        }
        if !(0.0..1.0).contains(&self.breaker.jitter) {
            return Err(anyhow!("breaker.jitter must be in [0, 1)"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(anyhow!("breaker.failure_threshold must be at least 1"));
        }
        if !(1..=100).contains(&self.snapshot.jpeg_quality) {
            return Err(anyhow!("snapshot.jpeg_quality must be in 1..=100"));
        }
        if self.capture.max_read_failures == 0 {
            return Err(anyhow!("ingest.max_read_failures must be at least 1"));
        }
        Ok(())
    }

    pub fn camera(&self, id: CameraId) -> Option<&CameraConfig> {
        self.cameras.iter().find(|camera| camera.id == id)
    }
}

fn camera_from_file(file: CameraConfigFile) -> Result<CameraConfig> {
    let defaults = CameraConfig::new(file.id, file.uri.clone());
    let line_file = file.line.unwrap_or_default();
    let line_defaults = LineConfig::default();
    Ok(CameraConfig {
        id: file.id,
        name: file.name.unwrap_or(defaults.name),
        kind: file.kind.unwrap_or(defaults.kind),
        uri: file.uri,
        transport: file.transport.unwrap_or_default(),
        backend_priority: match file.backend_priority {
            Some(names) => Some(parse_backends(&names)?),
            None => None,
        },
        width: file.width.unwrap_or(0),
        height: file.height.unwrap_or(0),
        latency_ms: file.latency_ms.unwrap_or(DEFAULT_LATENCY_MS),
        frame_skip: file.frame_skip.unwrap_or(1),
        adaptive_skip: file.adaptive_skip.unwrap_or(false),
        max_read_failures: file.max_read_failures,
        enabled: file.enabled.unwrap_or(true),
        line: LineConfig {
            orientation: line_file.orientation.unwrap_or(line_defaults.orientation),
            ratio: line_file.ratio.unwrap_or(line_defaults.ratio),
            reverse: line_file.reverse.unwrap_or(line_defaults.reverse),
        },
        counting: file.counting.unwrap_or(defaults.counting),
        face_tracking: file.face_tracking.unwrap_or(false),
        detector: file.detector,
    })
}

/// Source kind implied by a URI scheme. Bare device indices and `/dev/` paths are local.
pub fn infer_kind(uri: &str) -> SourceKind {
    let lower = uri.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        SourceKind::Http
    } else if lower.starts_with("/dev/")
        || (!uri.is_empty() && uri.chars().all(|c| c.is_ascii_digit()))
    {
        SourceKind::Local
    } else {
        SourceKind::Rtsp
    }
}

fn parse_backends(names: &[String]) -> Result<Vec<Backend>> {
    names
        .iter()
        .map(|name| Backend::from_str(name))
        .collect()
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{} must be within 0..=1, got {}", name, value));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<CrosslineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_kind_from_uri() {
        assert_eq!(infer_kind("rtsp://cam/1"), SourceKind::Rtsp);
        assert_eq!(infer_kind("HTTP://cam/mjpg"), SourceKind::Http);
        assert_eq!(infer_kind("0"), SourceKind::Local);
        assert_eq!(infer_kind("/dev/video2"), SourceKind::Local);
        assert_eq!(infer_kind("stub://lobby"), SourceKind::Rtsp);
    }

    #[test]
    fn camera_spec_carries_defaults() {
        let defaults = SourceDefaults {
            backend_priority: vec![Backend::Ffmpeg],
            extra_flags: vec!["-an".to_string()],
            ..SourceDefaults::default()
        };
        let mut camera = CameraConfig::new(3, "rtsp://cam/1");
        camera.transport = Transport::Udp;
        let spec = camera.source_spec(&defaults);
        assert_eq!(spec.transport, Transport::Udp);
        assert_eq!(spec.extra_flags, vec!["-an".to_string()]);
        assert_eq!(camera.priority(&defaults), vec![Backend::Ffmpeg]);

        camera.backend_priority = Some(vec![Backend::Gstreamer]);
        assert_eq!(camera.priority(&defaults), vec![Backend::Gstreamer]);
    }

    #[test]
    fn empty_file_gives_documented_defaults() {
        let cfg = CrosslineConfig::default();
        assert_eq!(cfg.queue_capacity, 2);
        assert_eq!(cfg.breaker.failure_threshold, 3);
        assert_eq!(cfg.tracker.iou_threshold, 0.3);
        assert_eq!(cfg.crossing.min_frames, 2);
        assert_eq!(cfg.watchdog.stale_after, Duration::from_secs(10));
        assert_eq!(cfg.snapshot.cache_max_age, Duration::from_secs(2));
    }
}
