//! Native GStreamer pipeline source.
//!
//! The appsink is configured with `max-buffers=1 drop=true sync=false`, so the
//! pipeline itself only ever holds the latest decoded frame and no extra queue sits
//! on top of it.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::time::Duration;

use super::{SourceCounters, SourceError, SourceInfo, SourceKind, SourceMetrics, SourceSpec};
use crate::frame::Frame;

pub struct GstreamerSource {
    spec: SourceSpec,
    pipeline: Option<gstreamer::Pipeline>,
    appsink: Option<gstreamer_app::AppSink>,
    pending: Option<Frame>,
    counters: SourceCounters,
    width: u32,
    height: u32,
    seq: u64,
    last_error: Option<String>,
}

impl GstreamerSource {
    pub fn new(spec: SourceSpec) -> Self {
        Self {
            spec,
            pipeline: None,
            appsink: None,
            pending: None,
            counters: SourceCounters::default(),
            width: 0,
            height: 0,
            seq: 0,
            last_error: None,
        }
    }

    fn describe(&self) -> String {
        let sink = "videoconvert ! video/x-raw,format=RGB ! \
                    appsink name=appsink sync=false max-buffers=1 drop=true";
        match self.spec.kind {
            SourceKind::Rtsp => format!(
                "rtspsrc location={} protocols={} latency={} ! decodebin ! {}",
                self.spec.uri,
                self.spec.transport.as_str(),
                self.spec.latency_ms(),
                sink
            ),
            _ => format!("uridecodebin uri={} ! {}", self.spec.uri, sink),
        }
    }

    fn build(&self) -> Result<(gstreamer::Pipeline, gstreamer_app::AppSink)> {
        gstreamer::init().context("initialize gstreamer")?;
        let pipeline = gstreamer::parse::launch(&self.describe())
            .context("build pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("pipeline is not a Pipeline"))?;
        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);
        Ok((pipeline, appsink))
    }

    pub fn open(&mut self) -> Result<(), SourceError> {
        let (pipeline, appsink) = self.build().map_err(|err| {
            log::warn!("GstreamerSource: {:#}", err);
            SourceError::UnsupportedCodec
        })?;
        if pipeline.set_state(gstreamer::State::Playing).is_err() {
            let kind = self.drain_bus(&pipeline).unwrap_or(SourceError::ConnectTimeout);
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(kind);
        }
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        self.counters.mark_open();

        // The first sample proves the stream actually carries decodable video.
        match self.pull(self.spec.open_timeout) {
            Some(frame) => {
                self.pending = Some(frame);
                Ok(())
            }
            None => {
                let kind = self
                    .pipeline
                    .clone()
                    .and_then(|pipeline| self.drain_bus(&pipeline))
                    .unwrap_or(SourceError::NoVideoStream);
                self.close();
                Err(kind)
            }
        }
    }

    pub fn read(&mut self, timeout: Duration) -> Result<Frame, SourceError> {
        if self.pipeline.is_none() {
            return Err(SourceError::NotOpen);
        }
        if let Some(frame) = self.pending.take() {
            self.counters.frame_out();
            return Ok(frame);
        }
        if let Some(pipeline) = self.pipeline.clone() {
            self.drain_bus(&pipeline);
        }
        let frame = self.pull(timeout).ok_or(SourceError::ReadTimeout)?;
        self.counters.frame_out();
        Ok(frame)
    }

    fn pull(&mut self, timeout: Duration) -> Option<Frame> {
        let appsink = self.appsink.as_ref()?;
        let sample =
            appsink.try_pull_sample(gstreamer::ClockTime::from_nseconds(timeout.as_nanos() as u64))?;
        match sample_to_pixels(&sample) {
            Ok((pixels, width, height)) => {
                self.width = width;
                self.height = height;
                self.seq += 1;
                self.counters.frame_in();
                Frame::new(pixels, width, height, self.seq).ok()
            }
            Err(err) => {
                log::warn!("GstreamerSource: {:#}", err);
                None
            }
        }
    }

    /// Records bus errors and classifies the most recent one.
    fn drain_bus(&mut self, pipeline: &gstreamer::Pipeline) -> Option<SourceError> {
        let bus = pipeline.bus()?;
        let mut kind = None;
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    let text = format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    );
                    kind = Some(classify_bus_error(&text));
                    self.last_error = Some(text);
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                    kind = Some(SourceError::NoVideoStream);
                }
                _ => {}
            }
        }
        kind
    }

    pub fn info(&self) -> SourceInfo {
        SourceInfo {
            width: self.width,
            height: self.height,
            fps: 0.0,
            codec: None,
            transport: (self.spec.kind == SourceKind::Rtsp).then_some(self.spec.transport),
        }
    }

    pub fn metrics(&self) -> SourceMetrics {
        self.counters.snapshot()
    }

    pub fn is_healthy(&self) -> bool {
        self.pipeline.is_some() && self.last_error.is_none()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }

    pub fn close(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gstreamer::State::Null);
        }
        self.appsink = None;
        self.pending = None;
    }
}

fn classify_bus_error(text: &str) -> SourceError {
    let lower = text.to_ascii_lowercase();
    if lower.contains("missing") || lower.contains("no decoder") || lower.contains("not-negotiated") {
        SourceError::UnsupportedCodec
    } else if lower.contains("no video") || lower.contains("no streams") {
        SourceError::NoVideoStream
    } else {
        SourceError::ConnectTimeout
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map buffer")?;
    let pixels = packed_rgb(map.as_slice(), width, height, stride)?;
    Ok((pixels, width, height))
}

/// Copies `height` rows of `width` RGB pixels out of a buffer laid out with `stride`
/// bytes per row. A buffer shorter than the caps promise is a bad frame.
fn packed_rgb(data: &[u8], width: u32, height: u32, stride: usize) -> Result<Vec<u8>, SourceError> {
    let row_bytes = (width as usize).checked_mul(3).ok_or(SourceError::ReadTimeout)?;
    let rows = height as usize;
    if stride == row_bytes {
        let len = row_bytes.checked_mul(rows).ok_or(SourceError::ReadTimeout)?;
        return match data.get(..len) {
            Some(packed) => Ok(packed.to_vec()),
            None => {
                log::warn!("GstreamerSource: buffer holds {} of {} bytes", data.len(), len);
                Err(SourceError::ReadTimeout)
            }
        };
    }

    let mut pixels = Vec::with_capacity(row_bytes.saturating_mul(rows));
    for row in 0..rows {
        let start = row.checked_mul(stride).ok_or(SourceError::ReadTimeout)?;
        let Some(line) = data.get(start..start.saturating_add(row_bytes)) else {
            log::warn!("GstreamerSource: buffer row {} is out of bounds", row);
            return Err(SourceError::ReadTimeout);
        };
        pixels.extend_from_slice(line);
    }
    Ok(pixels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_buffers_are_rejected_instead_of_sliced() {
        assert_eq!(packed_rgb(&[0u8; 11], 2, 2, 6), Err(SourceError::ReadTimeout));
        assert_eq!(packed_rgb(&[0u8; 13], 2, 2, 8), Err(SourceError::ReadTimeout));
    }

    #[test]
    fn strided_rows_are_packed() {
        let data = [1, 1, 1, 2, 2, 2, 0, 0, 3, 3, 3, 4, 4, 4, 0, 0];
        let pixels = packed_rgb(&data, 2, 2, 8).unwrap();
        assert_eq!(pixels, vec![1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4]);
        assert_eq!(packed_rgb(&pixels, 2, 2, 6).unwrap(), pixels);
    }

    #[test]
    fn rtsp_pipeline_honours_transport_and_latency() {
        let mut spec = SourceSpec::new("rtsp://cam/1", SourceKind::Rtsp)
            .with_transport(super::super::Transport::Udp);
        spec.latency_ms = 1_000;
        let desc = GstreamerSource::new(spec).describe();
        assert!(desc.contains("protocols=udp"));
        assert!(desc.contains("latency=300"));
        assert!(desc.contains("max-buffers=1 drop=true"));
    }

    #[test]
    fn bus_errors_are_classified() {
        assert_eq!(
            classify_bus_error("Missing decoder: H.265"),
            SourceError::UnsupportedCodec
        );
        assert_eq!(
            classify_bus_error("Could not open resource for reading"),
            SourceError::ConnectTimeout
        );
    }
}
