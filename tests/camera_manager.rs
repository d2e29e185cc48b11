use anyhow::Result;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossline::config::{CameraConfig, CrosslineConfig};
use crossline::manager::{Suppressed, DEFAULT_SNAPSHOT_TIMEOUT};
use crossline::storage::InMemoryEventSink;
use crossline::{
    open_capture, BreakerPolicy, BreakerState, CameraId, CameraManager, CaptureError,
    InMemoryStatusStore, PipelineFactory, SourceError, SourceKind, SourceSpec, StartOutcome,
    StatusStore, Transport,
};

const WAIT: Duration = Duration::from_secs(5);

fn camera(id: CameraId, uri: &str) -> CameraConfig {
    let mut camera = CameraConfig::new(id, uri);
    camera.detector = Some("none".to_string());
    camera
}

fn manager_with(
    cameras: Vec<CameraConfig>,
    policy: BreakerPolicy,
) -> (CameraManager, Arc<InMemoryStatusStore>) {
    let mut config = CrosslineConfig::default();
    config.cameras = cameras;
    config.breaker = policy;
    let factory = PipelineFactory::from_config(&config, Arc::new(InMemoryEventSink::new()));
    let status = Arc::new(InMemoryStatusStore::new());
    let manager = CameraManager::from_config(&config, factory).with_status_store(status.clone());
    (manager, status)
}

fn no_backoff(open_for: Duration) -> BreakerPolicy {
    BreakerPolicy {
        backoff_base: Duration::ZERO,
        jitter: 0.0,
        open_for,
        ..BreakerPolicy::default()
    }
}

fn wait_for(mut ready: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if ready() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn breaker_opens_after_three_failures_then_half_opens() -> Result<()> {
    let (manager, status) = manager_with(
        vec![camera(1, "stub://down?fail=connect_timeout")],
        no_backoff(Duration::from_millis(200)),
    );

    for _ in 0..3 {
        let outcome = manager.start(1).wait(WAIT);
        assert_eq!(
            outcome,
            Some(StartOutcome::Failed(CaptureError::StreamUnavailable(
                SourceError::ConnectTimeout
            )))
        );
    }
    let published = status.get(1)?.expect("status published");
    assert_eq!(published.breaker, BreakerState::Open);
    assert_eq!(published.fail_count, 3);
    assert!(!published.online);

    match manager.start(1).wait(WAIT) {
        Some(StartOutcome::Suppressed(Suppressed::BreakerOpen { .. })) => {}
        other => panic!("expected breaker suppression, got {:?}", other),
    }

    thread::sleep(Duration::from_millis(250));
    let outcome = manager.start(1).wait(WAIT);
    assert!(matches!(outcome, Some(StartOutcome::Failed(_))));
    let state = manager.circuit_state(1);
    assert_eq!(state.breaker, BreakerState::Open);
    assert_eq!(state.fail_count, 4);
    assert!(status
        .history()
        .iter()
        .any(|published| published.breaker == BreakerState::HalfOpen));
    Ok(())
}

#[test]
fn retry_gate_suppresses_immediate_restart() -> Result<()> {
    let policy = BreakerPolicy {
        backoff_base: Duration::from_secs(10),
        jitter: 0.0,
        ..BreakerPolicy::default()
    };
    let (manager, _status) = manager_with(vec![camera(1, "stub://down?fail=no_video")], policy);

    assert!(matches!(manager.start(1).wait(WAIT), Some(StartOutcome::Failed(_))));
    match manager.start(1).wait(WAIT) {
        Some(StartOutcome::Suppressed(Suppressed::Backoff { remaining })) => {
            assert!(remaining > Duration::from_secs(15));
        }
        other => panic!("expected backoff suppression, got {:?}", other),
    }
    let status = manager.status(1);
    assert_eq!(status.breaker, BreakerState::Closed);
    assert_eq!(status.fail_count, 1);
    assert!(status.next_retry_in_ms.is_some());
    Ok(())
}

#[test]
fn successful_start_closes_breaker_and_serves_cached_snapshots() -> Result<()> {
    let (manager, status) = manager_with(
        vec![camera(1, "stub://lobby?fps=50&width=48&height=32")],
        BreakerPolicy::default(),
    );

    assert_eq!(manager.start(1).wait(WAIT), Some(StartOutcome::Started));
    assert!(manager.is_running(1));
    assert_eq!(manager.start(1).wait(WAIT), Some(StartOutcome::AlreadyRunning));
    let published = status.get(1)?.expect("status published");
    assert_eq!(published.breaker, BreakerState::Closed);
    assert!(published.online);

    assert!(wait_for(|| manager.latest_frame(1).is_some()));
    let snapshot = manager.snapshot(1, DEFAULT_SNAPSHOT_TIMEOUT);
    assert!(snapshot.ok);
    assert_eq!(snapshot.detail, "from_cache");
    let frame = snapshot.frame.expect("frame");
    assert_eq!((frame.width, frame.height), (48, 32));

    manager.stop(1, WAIT)?;
    assert!(!manager.is_running(1));
    Ok(())
}

#[test]
fn snapshot_probes_when_cache_is_cold() -> Result<()> {
    let (manager, _status) = manager_with(
        vec![
            camera(1, "stub://idle?width=2560&height=1440"),
            camera(2, "stub://down?fail=connect_timeout"),
            camera(3, "stub://blank?frames=0"),
        ],
        BreakerPolicy::default(),
    );

    let probed = manager.snapshot(1, DEFAULT_SNAPSHOT_TIMEOUT);
    assert!(probed.ok);
    assert_eq!(probed.detail, "from_probe");
    let frame = probed.frame.expect("frame");
    assert!(frame.width <= 1920 && frame.height <= 1080);
    assert!(!manager.is_running(1));

    let unavailable = manager.snapshot(2, Duration::from_millis(200));
    assert!(!unavailable.ok);
    assert!(unavailable.detail.starts_with("unavailable:"));

    let empty = manager.snapshot(3, Duration::from_millis(200));
    assert!(!empty.ok);
    assert_eq!(empty.detail, "no_frame");

    let unknown = manager.snapshot(99, Duration::from_millis(200));
    assert!(!unknown.ok);
    assert!(unknown.detail.starts_with("error:"));
    Ok(())
}

#[test]
fn frame_caches_are_per_camera() -> Result<()> {
    let (manager, _status) = manager_with(
        vec![
            camera(1, "stub://a?fps=50&width=32&height=24"),
            camera(2, "stub://b?fps=50&width=64&height=48"),
        ],
        BreakerPolicy::default(),
    );
    for (_, ticket) in manager.supervise() {
        assert_eq!(ticket.wait(WAIT), Some(StartOutcome::Started));
    }
    assert!(wait_for(|| {
        manager.latest_frame(1).is_some() && manager.latest_frame(2).is_some()
    }));
    let a = manager.latest_frame(1).expect("camera 1 frame");
    let b = manager.latest_frame(2).expect("camera 2 frame");
    assert_eq!((a.width, a.height), (32, 24));
    assert_eq!((b.width, b.height), (64, 48));

    manager.shutdown(WAIT);
    assert!(!manager.is_running(1) && !manager.is_running(2));
    Ok(())
}

#[test]
fn no_video_over_tcp_falls_back_to_udp() -> Result<()> {
    let uri = "stub://cam?fail=no_video&fail_transport=tcp";
    let spec = SourceSpec::new(uri, SourceKind::Rtsp);
    let source = open_capture(&spec, &[]).map_err(anyhow::Error::new)?;
    assert_eq!(source.info().transport, Some(Transport::Udp));

    let (manager, _status) = manager_with(vec![camera(1, uri)], BreakerPolicy::default());
    assert_eq!(manager.start(1).wait(WAIT), Some(StartOutcome::Started));
    assert!(wait_for(|| manager
        .health(1)
        .is_some_and(|health| health.transport == Some(Transport::Udp))));
    manager.shutdown(WAIT);
    Ok(())
}

#[test]
fn disabled_and_unknown_cameras_do_not_start() {
    let mut disabled = camera(1, "stub://off");
    disabled.enabled = false;
    let (manager, _status) = manager_with(vec![disabled], BreakerPolicy::default());

    assert_eq!(manager.start(1).wait(WAIT), Some(StartOutcome::Disabled));
    assert_eq!(
        manager.start(42).wait(WAIT),
        Some(StartOutcome::Failed(CaptureError::UnknownCamera(42)))
    );
    assert!(manager.supervise().is_empty());
}

#[test]
fn refresh_flags_applies_registry_changes_to_running_pipeline() -> Result<()> {
    let (manager, _status) = manager_with(
        vec![camera(1, "stub://lobby?fps=50")],
        BreakerPolicy::default(),
    );
    assert_eq!(manager.start(1).wait(WAIT), Some(StartOutcome::Started));
    assert!(wait_for(|| manager
        .health(1)
        .is_some_and(|health| health.frames_captured > 0)));

    let mut updated = camera(1, "stub://lobby?fps=50");
    updated.frame_skip = 3;
    manager.upsert_camera(updated);
    manager.refresh_flags(1).map_err(anyhow::Error::new)?;
    assert!(wait_for(|| manager
        .health(1)
        .is_some_and(|health| health.current_skip == 3 && health.restarts >= 1)));

    assert!(matches!(
        manager.refresh_flags(7),
        Err(CaptureError::UnknownCamera(7))
    ));
    manager.shutdown(WAIT);
    Ok(())
}
