//! Camera supervision: one circuit breaker and one pipeline slot per camera.
//!
//! `start` never blocks the caller. Admission (breaker + jittered retry gate) is
//! decided inline; the actual open/launch runs on a `start-<id>` thread and its
//! outcome is delivered through a `StartTicket`. Every breaker transition is
//! published to the status store, whose failures are logged and dropped.
//!
//! State is scoped per camera: the registry maps are only locked long enough to
//! fetch a camera's own `Arc<Mutex<..>>` entry, so cameras never wait on each other.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::capture::{CaptureHealth, FrameCache};
use crate::config::{CameraConfig, CrosslineConfig, SnapshotSettings};
use crate::detect::ObjectClass;
use crate::frame::Frame;
use crate::ingest::{open_capture, CaptureError, SourceError};
use crate::pipeline::{FrameStream, Pipeline, PipelineFactory};
use crate::storage::{CameraStatus, StatusStore};
use crate::track::Counts;
use crate::watchdog::Watchdog;
use crate::CameraId;

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
pub const DEFAULT_JITTER: f64 = 0.3;
pub const DEFAULT_BREAKER_OPEN: Duration = Duration::from_secs(15);
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_SNAPSHOT_TIMEOUT: Duration = Duration::from_millis(800);

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------------
// Circuit breaker
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    #[default]
    Closed,
    HalfOpen,
    Open,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::HalfOpen => "HALF_OPEN",
            BreakerState::Open => "OPEN",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BreakerPolicy {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Fraction of the delay added or removed at random.
    pub jitter: f64,
    pub open_for: Duration,
    /// Consecutive failures that trip a closed breaker.
    pub failure_threshold: u32,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            jitter: DEFAULT_JITTER,
            open_for: DEFAULT_BREAKER_OPEN,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

/// `min(max, base * 2^min(fail_count, 6))` scaled by `1 ± jitter`.
pub fn retry_delay(policy: &BreakerPolicy, fail_count: u32, rng: &mut impl Rng) -> Duration {
    let delay = crate::backoff::delay_for(policy.backoff_base, policy.backoff_max, fail_count.min(6));
    let factor = if policy.jitter > 0.0 {
        1.0 + rng.gen_range(-policy.jitter..=policy.jitter)
    } else {
        1.0
    };
    delay.mul_f64(factor.max(0.0))
}

/// Why a `start` call was a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Suppressed {
    BreakerOpen { remaining: Duration },
    Backoff { remaining: Duration },
    InFlight,
}

impl fmt::Display for Suppressed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Suppressed::BreakerOpen { remaining } => {
                write!(f, "breaker open for another {:.1}s", remaining.as_secs_f64())
            }
            Suppressed::Backoff { remaining } => {
                write!(f, "retry in {:.1}s", remaining.as_secs_f64())
            }
            Suppressed::InFlight => f.write_str("start already in flight"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CircuitState {
    pub fail_count: u32,
    pub next_retry: Option<Instant>,
    pub breaker: BreakerState,
    pub opened_at: Option<Instant>,
    pub in_flight: bool,
    pub last_error: Option<String>,
}

impl CircuitState {
    /// Gate for a start attempt at `now`. An open breaker whose cooldown elapsed
    /// moves to half-open here.
    pub fn admit(&mut self, policy: &BreakerPolicy, now: Instant) -> Result<(), Suppressed> {
        if self.in_flight {
            return Err(Suppressed::InFlight);
        }
        if self.breaker == BreakerState::Open {
            let opened_at = self.opened_at.unwrap_or(now);
            let elapsed = now.saturating_duration_since(opened_at);
            if elapsed < policy.open_for {
                return Err(Suppressed::BreakerOpen {
                    remaining: policy.open_for - elapsed,
                });
            }
            self.breaker = BreakerState::HalfOpen;
        }
        if let Some(next_retry) = self.next_retry {
            if now < next_retry {
                return Err(Suppressed::Backoff {
                    remaining: next_retry - now,
                });
            }
        }
        Ok(())
    }

    pub fn record_success(&mut self) {
        *self = CircuitState::default();
    }

    pub fn record_failure(
        &mut self,
        policy: &BreakerPolicy,
        now: Instant,
        delay: Duration,
        error: String,
    ) {
        self.in_flight = false;
        self.fail_count = self.fail_count.saturating_add(1);
        self.next_retry = Some(now + delay);
        self.last_error = Some(error);
        let trips = match self.breaker {
            BreakerState::Closed => self.fail_count >= policy.failure_threshold,
            BreakerState::HalfOpen => true,
            BreakerState::Open => false,
        };
        if trips {
            self.breaker = BreakerState::Open;
            self.opened_at = Some(now);
        }
    }
}

// ----------------------------------------------------------------------------
// Start outcomes
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    Suppressed(Suppressed),
    Disabled,
    Failed(CaptureError),
}

/// Completion handle for a `start` call.
pub struct StartTicket {
    rx: Receiver<StartOutcome>,
}

impl StartTicket {
    fn ready(outcome: StartOutcome) -> Self {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(outcome);
        Self { rx }
    }

    /// Waits up to `timeout`; `None` while the attempt is still running.
    pub fn wait(&self, timeout: Duration) -> Option<StartOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(StartOutcome::Failed(
                CaptureError::Launch("start worker exited without a result".to_string()),
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// Snapshots
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct SnapshotResult {
    pub ok: bool,
    pub frame: Option<Frame>,
    /// `from_cache`, `from_probe`, `no_frame`, `unavailable:<err>` or `error:<err>`.
    pub detail: String,
}

impl SnapshotResult {
    fn failed(detail: String) -> Self {
        Self {
            ok: false,
            frame: None,
            detail,
        }
    }
}

// ----------------------------------------------------------------------------
// Manager
// ----------------------------------------------------------------------------

type PipelineSlot = Arc<Mutex<Option<Pipeline>>>;

#[derive(Clone)]
pub struct CameraManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    cameras: RwLock<BTreeMap<CameraId, CameraConfig>>,
    circuits: Mutex<HashMap<CameraId, Arc<Mutex<CircuitState>>>>,
    pipelines: Mutex<HashMap<CameraId, PipelineSlot>>,
    cache: FrameCache,
    status: Option<Arc<dyn StatusStore>>,
    factory: PipelineFactory,
    policy: BreakerPolicy,
    snapshot: SnapshotSettings,
    watchdog: Option<Watchdog>,
}

impl CameraManager {
    pub fn new(
        cameras: Vec<CameraConfig>,
        factory: PipelineFactory,
        policy: BreakerPolicy,
        snapshot: SnapshotSettings,
    ) -> Self {
        let cameras = cameras.into_iter().map(|camera| (camera.id, camera)).collect();
        Self {
            inner: Arc::new(ManagerInner {
                cameras: RwLock::new(cameras),
                circuits: Mutex::new(HashMap::new()),
                pipelines: Mutex::new(HashMap::new()),
                cache: FrameCache::new(),
                status: None,
                factory,
                policy,
                snapshot,
                watchdog: None,
            }),
        }
    }

    pub fn from_config(config: &CrosslineConfig, factory: PipelineFactory) -> Self {
        Self::new(
            config.cameras.clone(),
            factory,
            config.breaker,
            config.snapshot.clone(),
        )
    }

    /// Attaches the status store. Only valid before the manager is shared.
    pub fn with_status_store(mut self, store: Arc<dyn StatusStore>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.status = Some(store);
        }
        self
    }

    /// Registers started pipelines with `watchdog`. Only valid before the manager is shared.
    pub fn with_watchdog(mut self, watchdog: Watchdog) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.watchdog = Some(watchdog);
        }
        self
    }

    pub fn camera(&self, id: CameraId) -> Option<CameraConfig> {
        self.inner
            .cameras
            .read()
            .ok()
            .and_then(|cameras| cameras.get(&id).cloned())
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.inner
            .cameras
            .read()
            .map(|cameras| cameras.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Adds or replaces a camera's settings. Running pipelines pick them up on
    /// `refresh_flags`.
    pub fn upsert_camera(&self, camera: CameraConfig) {
        if let Ok(mut cameras) = self.inner.cameras.write() {
            cameras.insert(camera.id, camera);
        }
    }

    /// Brings a camera online unless its breaker or retry gate says otherwise.
    pub fn start(&self, id: CameraId) -> StartTicket {
        let Some(camera) = self.camera(id) else {
            return StartTicket::ready(StartOutcome::Failed(CaptureError::UnknownCamera(id)));
        };
        if !camera.enabled {
            return StartTicket::ready(StartOutcome::Disabled);
        }
        let slot = self.inner.pipeline_slot(id);
        if slot_running(&slot) {
            return StartTicket::ready(StartOutcome::AlreadyRunning);
        }

        let circuit = self.inner.circuit(id);
        let admitted = match circuit.lock() {
            Ok(mut state) => {
                let admitted = state.admit(&self.inner.policy, Instant::now());
                if admitted.is_ok() {
                    state.in_flight = true;
                }
                admitted
            }
            Err(_) => Err(Suppressed::InFlight),
        };
        self.inner.publish_status(id);
        if let Err(reason) = admitted {
            log::debug!("manager[{}]: start suppressed: {}", id, reason);
            return StartTicket::ready(StartOutcome::Suppressed(reason));
        }

        log::info!(
            "manager[{}]: start kind={:?} transport={} uri={}",
            id,
            camera.kind,
            camera.transport.as_str(),
            crate::ingest::redact_uri(&camera.uri)
        );
        let (tx, rx) = mpsc::channel();
        let inner = self.inner.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("start-{}", id))
            .spawn(move || {
                let outcome = inner.bring_online(&camera, &slot, &circuit);
                let _ = tx.send(outcome);
            });
        match spawned {
            Ok(_) => StartTicket { rx },
            Err(err) => {
                let error = CaptureError::Launch(err.to_string());
                self.inner.record_failure(id, &error);
                StartTicket::ready(StartOutcome::Failed(error))
            }
        }
    }

    /// Stops the camera's pipeline (bounded join) and starts it again.
    pub fn restart(&self, id: CameraId) -> StartTicket {
        if let Err(err) = self.stop(id, STOP_TIMEOUT) {
            log::warn!("manager[{}]: stop during restart: {}", id, err);
        }
        self.start(id)
    }

    /// Pushes the registry's current settings into the running pipeline and asks
    /// capture to reopen. No-op when the camera is not running.
    pub fn refresh_flags(&self, id: CameraId) -> Result<(), CaptureError> {
        let camera = self.camera(id).ok_or(CaptureError::UnknownCamera(id))?;
        let slot = self.inner.pipeline_slot(id);
        let guard = slot
            .lock()
            .map_err(|_| CaptureError::Launch("pipeline slot poisoned".to_string()))?;
        match guard.as_ref() {
            Some(pipeline) if pipeline.is_running() => {
                pipeline.refresh(&camera, &self.inner.factory.defaults);
            }
            _ => log::debug!("manager[{}]: refresh_flags on idle camera", id),
        }
        Ok(())
    }

    /// Stops and forgets the camera's pipeline.
    pub fn stop(&self, id: CameraId, timeout: Duration) -> anyhow::Result<()> {
        let slot = self.inner.pipeline_slot(id);
        let pipeline = slot.lock().ok().and_then(|mut guard| guard.take());
        if let Some(watchdog) = &self.inner.watchdog {
            watchdog.unregister(id);
        }
        match pipeline {
            Some(mut pipeline) => pipeline.stop(timeout),
            None => Ok(()),
        }
    }

    /// A recent frame: the cache when fresh, otherwise a short-lived probe capture.
    pub fn snapshot(&self, id: CameraId, timeout: Duration) -> SnapshotResult {
        let settings = &self.inner.snapshot;
        if let Some(frame) = self.inner.cache.fresh(id, settings.cache_max_age) {
            return SnapshotResult {
                ok: true,
                frame: Some(self.cap_frame(frame)),
                detail: "from_cache".to_string(),
            };
        }
        let Some(camera) = self.camera(id) else {
            return SnapshotResult::failed(format!("error:{}", CaptureError::UnknownCamera(id)));
        };

        let defaults = &self.inner.factory.defaults;
        let mut spec = camera.source_spec(defaults);
        spec.open_timeout = settings.probe_timeout;
        let priority = camera.priority(defaults);
        let deadline = settings.probe_timeout + timeout;
        let (tx, rx) = mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name(format!("probe-{}", id))
            .spawn(move || {
                let result = match open_capture(&spec, &priority) {
                    Ok(mut source) => {
                        let read = source.read(timeout);
                        source.close();
                        match read {
                            Ok(frame) => Ok(frame),
                            Err(SourceError::ReadTimeout) => Err("no_frame".to_string()),
                            Err(err) => Err(format!("error:{}", err)),
                        }
                    }
                    Err(err) => Err(format!("unavailable:{}", err)),
                };
                let _ = tx.send(result);
            });
        if let Err(err) = spawned {
            return SnapshotResult::failed(format!("error:{}", err));
        }
        match rx.recv_timeout(deadline) {
            Ok(Ok(frame)) => SnapshotResult {
                ok: true,
                frame: Some(self.cap_frame(frame)),
                detail: "from_probe".to_string(),
            },
            Ok(Err(detail)) => SnapshotResult::failed(detail),
            Err(_) => SnapshotResult::failed("error:probe timed out".to_string()),
        }
    }

    fn cap_frame(&self, frame: Frame) -> Frame {
        let settings = &self.inner.snapshot;
        let fallback = frame.clone();
        frame
            .downscale_to_fit(settings.max_width, settings.max_height)
            .unwrap_or_else(|err| {
                log::warn!("manager: snapshot downscale failed: {}", err);
                fallback
            })
    }

    /// Reaps pipelines whose capture gave up and (re)starts every enabled camera
    /// that is offline. The breaker decides whether an attempt actually happens.
    pub fn supervise(&self) -> Vec<(CameraId, StartTicket)> {
        let mut tickets = Vec::new();
        for id in self.camera_ids() {
            let enabled = self.camera(id).is_some_and(|camera| camera.enabled);
            self.inner.reap(id);
            if enabled && !slot_running(&self.inner.pipeline_slot(id)) {
                tickets.push((id, self.start(id)));
            }
        }
        tickets
    }

    pub fn circuit_state(&self, id: CameraId) -> CircuitState {
        self.inner
            .circuit(id)
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    pub fn status(&self, id: CameraId) -> CameraStatus {
        self.inner.status_of(id)
    }

    pub fn is_running(&self, id: CameraId) -> bool {
        slot_running(&self.inner.pipeline_slot(id))
    }

    pub fn health(&self, id: CameraId) -> Option<CaptureHealth> {
        self.with_pipeline(id, |pipeline| pipeline.health())
    }

    pub fn counts(&self, id: CameraId, class: ObjectClass) -> Option<Counts> {
        self.with_pipeline(id, |pipeline| pipeline.counts(class))
    }

    /// Encoded frame stream for a running camera.
    pub fn frames(&self, id: CameraId) -> Option<FrameStream> {
        self.with_pipeline(id, |pipeline| pipeline.frames())
    }

    pub fn latest_frame(&self, id: CameraId) -> Option<Frame> {
        self.inner.cache.latest(id)
    }

    /// Stops every pipeline, each join bounded by `timeout`.
    pub fn shutdown(&self, timeout: Duration) {
        for id in self.camera_ids() {
            if let Err(err) = self.stop(id, timeout) {
                log::warn!("manager[{}]: shutdown: {}", id, err);
            }
        }
    }

    fn with_pipeline<T>(&self, id: CameraId, f: impl FnOnce(&Pipeline) -> T) -> Option<T> {
        let slot = self.inner.pipeline_slot(id);
        let guard = slot.lock().ok()?;
        guard.as_ref().map(f)
    }
}

impl ManagerInner {
    fn circuit(&self, id: CameraId) -> Arc<Mutex<CircuitState>> {
        match self.circuits.lock() {
            Ok(mut circuits) => circuits.entry(id).or_default().clone(),
            Err(_) => Arc::new(Mutex::new(CircuitState::default())),
        }
    }

    fn pipeline_slot(&self, id: CameraId) -> PipelineSlot {
        match self.pipelines.lock() {
            Ok(mut pipelines) => pipelines.entry(id).or_default().clone(),
            Err(_) => Arc::new(Mutex::new(None)),
        }
    }

    fn bring_online(
        &self,
        camera: &CameraConfig,
        slot: &PipelineSlot,
        circuit: &Arc<Mutex<CircuitState>>,
    ) -> StartOutcome {
        let started = Instant::now();
        let spec = camera.source_spec(&self.factory.defaults);
        let priority = camera.priority(&self.factory.defaults);
        let launched = open_capture(&spec, &priority).and_then(|source| {
            self.factory
                .launch(camera, source, self.cache.slot(camera.id))
                .map_err(|err| CaptureError::Launch(format!("{:#}", err)))
        });
        let elapsed = started.elapsed();
        if elapsed > Duration::from_secs(5) {
            log::warn!("manager[{}]: start took {:.2}s", camera.id, elapsed.as_secs_f64());
        }

        match launched {
            Ok(pipeline) => {
                if let Some(watchdog) = &self.watchdog {
                    watchdog.register(camera.id, pipeline.heartbeat());
                }
                if let Ok(mut guard) = slot.lock() {
                    *guard = Some(pipeline);
                }
                if let Ok(mut state) = circuit.lock() {
                    state.record_success();
                }
                log::info!("manager[{}]: online", camera.id);
                self.publish_status(camera.id);
                StartOutcome::Started
            }
            Err(err) => {
                self.record_failure(camera.id, &err);
                StartOutcome::Failed(err)
            }
        }
    }

    fn record_failure(&self, id: CameraId, error: &CaptureError) {
        let circuit = self.circuit(id);
        if let Ok(mut state) = circuit.lock() {
            let delay = retry_delay(
                &self.policy,
                state.fail_count.saturating_add(1),
                &mut rand::thread_rng(),
            );
            state.record_failure(&self.policy, Instant::now(), delay, error.to_string());
            log::warn!(
                "manager[{}]: start failed ({}), fails={} breaker={} retry in {:.1}s",
                id,
                error,
                state.fail_count,
                state.breaker,
                delay.as_secs_f64()
            );
        }
        self.publish_status(id);
    }

    /// Drops a pipeline whose capture thread exited, feeding errors to the breaker.
    fn reap(&self, id: CameraId) {
        let slot = self.pipeline_slot(id);
        let exited = {
            let Ok(mut guard) = slot.lock() else {
                return;
            };
            let finished = guard
                .as_mut()
                .and_then(|pipeline| pipeline.exit_status());
            match finished {
                Some(result) => {
                    if let Some(mut pipeline) = guard.take() {
                        let _ = pipeline.stop(STOP_TIMEOUT);
                    }
                    Some(result)
                }
                None => None,
            }
        };
        let Some(result) = exited else {
            return;
        };
        if let Some(watchdog) = &self.watchdog {
            watchdog.unregister(id);
        }
        match result {
            Ok(()) => {
                log::info!("manager[{}]: pipeline exited", id);
                self.publish_status(id);
            }
            Err(err) => self.record_failure(id, &err),
        }
    }

    fn status_of(&self, id: CameraId) -> CameraStatus {
        let state = self
            .circuit(id)
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default();
        let now = Instant::now();
        CameraStatus {
            camera_id: id,
            breaker: state.breaker,
            fail_count: state.fail_count,
            next_retry_in_ms: state
                .next_retry
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
            online: slot_running(&self.pipeline_slot(id)),
            last_error: state.last_error,
            updated_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    fn publish_status(&self, id: CameraId) {
        let Some(store) = &self.status else {
            return;
        };
        if let Err(err) = store.publish(&self.status_of(id)) {
            log::warn!("manager[{}]: status publish failed: {}", id, err);
        }
    }
}

fn slot_running(slot: &PipelineSlot) -> bool {
    slot.lock()
        .map(|guard| guard.as_ref().is_some_and(|pipeline| pipeline.is_running()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy() -> BreakerPolicy {
        BreakerPolicy {
            backoff_base: Duration::ZERO,
            ..BreakerPolicy::default()
        }
    }

    #[test]
    fn breaker_trips_after_threshold_and_half_opens() {
        let policy = policy();
        let mut state = CircuitState::default();
        let t0 = Instant::now();
        for _ in 0..3 {
            assert!(state.admit(&policy, t0).is_ok());
            state.record_failure(&policy, t0, Duration::ZERO, "x".into());
        }
        assert_eq!(state.breaker, BreakerState::Open);
        assert!(matches!(
            state.admit(&policy, t0 + Duration::from_secs(14)),
            Err(Suppressed::BreakerOpen { .. })
        ));

        let later = t0 + Duration::from_secs(16);
        assert!(state.admit(&policy, later).is_ok());
        assert_eq!(state.breaker, BreakerState::HalfOpen);
        state.record_success();
        assert_eq!(state.breaker, BreakerState::Closed);
        assert_eq!(state.fail_count, 0);
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_window() {
        let policy = policy();
        let t0 = Instant::now();
        let mut state = CircuitState {
            breaker: BreakerState::Open,
            opened_at: Some(t0),
            fail_count: 3,
            ..CircuitState::default()
        };
        let later = t0 + Duration::from_secs(20);
        assert!(state.admit(&policy, later).is_ok());
        state.record_failure(&policy, later, Duration::ZERO, "x".into());
        assert_eq!(state.breaker, BreakerState::Open);
        assert_eq!(state.opened_at, Some(later));
    }

    #[test]
    fn retry_gate_blocks_until_next_retry() {
        let policy = BreakerPolicy::default();
        let t0 = Instant::now();
        let mut state = CircuitState::default();
        state.record_failure(&policy, t0, Duration::from_secs(1), "x".into());
        assert!(matches!(
            state.admit(&policy, t0 + Duration::from_millis(500)),
            Err(Suppressed::Backoff { .. })
        ));
        assert!(state.admit(&policy, t0 + Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn retry_delay_is_capped_and_jittered() {
        let policy = BreakerPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for fails in 0..12 {
            let delay = retry_delay(&policy, fails, &mut rng).as_secs_f64();
            let nominal = (0.5 * 2f64.powi(fails.min(6) as i32)).min(30.0);
            assert!(delay >= nominal * 0.7 - 1e-9 && delay <= nominal * 1.3 + 1e-9);
        }
        let exact = BreakerPolicy {
            jitter: 0.0,
            ..policy
        };
        assert_eq!(retry_delay(&exact, 1, &mut rng), Duration::from_secs(1));
        assert_eq!(retry_delay(&exact, 9, &mut rng), Duration::from_secs(30));
    }
}
