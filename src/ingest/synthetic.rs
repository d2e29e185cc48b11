//! Synthetic `stub://` source for tests and demos.
//!
//! `stub://<name>?width=64&height=48&fps=0&frames=0&fail=<kind>&fail_transport=<tcp|udp>
//! &fail_backend=<backend>&open_delay_ms=0`
//!
//! Frames show a bright block sliding left to right over a dark background. `fail`
//! makes `open()` return that error, optionally only for one transport or for the
//! backend this instance emulates. `frames` ends the stream after that many frames.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Backend, SourceCounters, SourceError, SourceInfo, SourceMetrics, SourceSpec, Transport};
use crate::frame::Frame;

const DEFAULT_WIDTH: u32 = 64;
const DEFAULT_HEIGHT: u32 = 48;

#[derive(Clone, Debug, Default)]
struct StubParams {
    width: Option<u32>,
    height: Option<u32>,
    fps: u32,
    frames: Option<u64>,
    fail: Option<SourceError>,
    fail_transport: Option<Transport>,
    fail_backend: Option<Backend>,
    open_delay: Duration,
}

impl StubParams {
    fn parse(uri: &str) -> Self {
        let mut params = Self::default();
        let Ok(url) = url::Url::parse(uri) else {
            return params;
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "width" => params.width = value.parse().ok(),
                "height" => params.height = value.parse().ok(),
                "fps" => params.fps = value.parse().unwrap_or(0),
                "frames" => params.frames = value.parse().ok(),
                "fail" => params.fail = parse_failure(&value),
                "fail_transport" => {
                    params.fail_transport = match value.as_ref() {
                        "tcp" => Some(Transport::Tcp),
                        "udp" => Some(Transport::Udp),
                        _ => None,
                    }
                }
                "fail_backend" => params.fail_backend = value.parse().ok(),
                "open_delay_ms" => {
                    params.open_delay = Duration::from_millis(value.parse().unwrap_or(0))
                }
                _ => {}
            }
        }
        params
    }
}

fn parse_failure(value: &str) -> Option<SourceError> {
    match value {
        "connect_timeout" | "timeout" => Some(SourceError::ConnectTimeout),
        "no_video" | "no_video_stream" => Some(SourceError::NoVideoStream),
        "codec" | "unsupported_codec" => Some(SourceError::UnsupportedCodec),
        _ => None,
    }
}

pub struct SyntheticSource {
    spec: SourceSpec,
    emulates: Backend,
    params: StubParams,
    width: u32,
    height: u32,
    frame_count: u64,
    open: bool,
    last_emit: Option<Instant>,
    counters: Arc<SourceCounters>,
}

impl SyntheticSource {
    pub fn new(spec: SourceSpec, emulates: Backend) -> Self {
        let params = StubParams::parse(&spec.uri);
        let width = params
            .width
            .or((spec.width > 0).then_some(spec.width))
            .unwrap_or(DEFAULT_WIDTH);
        let height = params
            .height
            .or((spec.height > 0).then_some(spec.height))
            .unwrap_or(DEFAULT_HEIGHT);
        Self {
            spec,
            emulates,
            params,
            width,
            height,
            frame_count: 0,
            open: false,
            last_emit: None,
            counters: Arc::new(SourceCounters::default()),
        }
    }

    pub fn open(&mut self) -> Result<(), SourceError> {
        if !self.params.open_delay.is_zero() {
            std::thread::sleep(self.params.open_delay);
        }
        if let Some(kind) = self.params.fail {
            let transport_matches = self
                .params
                .fail_transport
                .map_or(true, |transport| transport == self.spec.transport);
            let backend_matches = self
                .params
                .fail_backend
                .map_or(true, |backend| backend == self.emulates);
            if transport_matches && backend_matches {
                return Err(kind);
            }
        }
        self.open = true;
        self.frame_count = 0;
        self.counters.mark_open();
        log::info!(
            "SyntheticSource: connected to {} as {} over {}",
            self.spec.uri,
            self.emulates,
            self.spec.transport.as_str()
        );
        Ok(())
    }

    pub fn read(&mut self, timeout: Duration) -> Result<Frame, SourceError> {
        if !self.open {
            return Err(SourceError::NotOpen);
        }
        if self.exhausted() {
            return Err(SourceError::ReadTimeout);
        }
        if self.params.fps > 0 {
            let interval = Duration::from_millis(1000 / self.params.fps as u64);
            if let Some(last) = self.last_emit {
                let wait = interval.saturating_sub(last.elapsed());
                if wait > timeout {
                    std::thread::sleep(timeout);
                    return Err(SourceError::ReadTimeout);
                }
                std::thread::sleep(wait);
            }
        }
        self.frame_count += 1;
        self.last_emit = Some(Instant::now());
        let pixels = self.render();
        let frame = Frame::new(pixels, self.width, self.height, self.frame_count)
            .map_err(|_| SourceError::ReadTimeout)?;
        self.counters.frame_in();
        self.counters.frame_out();
        Ok(frame)
    }

    fn exhausted(&self) -> bool {
        self.params
            .frames
            .is_some_and(|limit| self.frame_count >= limit)
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let block = (w / 8).max(1);
        let start = (self.frame_count as usize * 2) % w;
        let mut pixels = vec![40u8; w * h * 3];
        for y in h / 4..(h * 3 / 4).max(h / 4 + 1).min(h) {
            for dx in 0..block {
                let x = (start + dx) % w;
                let offset = (y * w + x) * 3;
                pixels[offset..offset + 3].copy_from_slice(&[230, 220, 200]);
            }
        }
        pixels
    }

    pub fn info(&self) -> SourceInfo {
        SourceInfo {
            width: self.width,
            height: self.height,
            fps: self.params.fps as f32,
            codec: Some("synthetic".to_string()),
            transport: Some(self.spec.transport),
        }
    }

    pub fn metrics(&self) -> SourceMetrics {
        self.counters.snapshot()
    }

    pub fn is_healthy(&self) -> bool {
        self.open && !self.exhausted()
    }

    pub fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SourceKind;

    fn source(uri: &str) -> SyntheticSource {
        SyntheticSource::new(SourceSpec::new(uri, SourceKind::Rtsp), Backend::Ffmpeg)
    }

    #[test]
    fn produces_sequenced_frames() {
        let mut source = source("stub://test?width=32&height=16");
        source.open().unwrap();
        let first = source.read(Duration::from_millis(10)).unwrap();
        let second = source.read(Duration::from_millis(10)).unwrap();
        assert_eq!((first.width, first.height), (32, 16));
        assert_eq!((first.seq, second.seq), (1, 2));
        assert_ne!(first.pixels(), second.pixels());
    }

    #[test]
    fn stream_ends_after_frame_limit() {
        let mut source = source("stub://test?frames=1");
        source.open().unwrap();
        assert!(source.read(Duration::from_millis(10)).is_ok());
        assert!(!source.is_healthy());
        assert_eq!(
            source.read(Duration::from_millis(10)).unwrap_err(),
            SourceError::ReadTimeout
        );
    }

    #[test]
    fn failure_injection_respects_transport() {
        let mut tcp = source("stub://test?fail=no_video&fail_transport=tcp");
        assert_eq!(tcp.open().unwrap_err(), SourceError::NoVideoStream);

        let spec = SourceSpec::new("stub://test?fail=no_video&fail_transport=tcp", SourceKind::Rtsp)
            .with_transport(Transport::Udp);
        let mut udp = SyntheticSource::new(spec, Backend::Ffmpeg);
        assert!(udp.open().is_ok());
    }

    #[test]
    fn failure_injection_respects_backend() {
        let mut other = source("stub://test?fail=codec&fail_backend=gstreamer");
        assert!(other.open().is_ok());
    }
}
