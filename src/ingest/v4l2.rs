//! Local V4L2 capture device.
//!
//! No network recovery here: a failed dequeue is reported as `READ_TIMEOUT` and the
//! capture worker decides whether to reopen the device.

use anyhow::Context;
use ouroboros::self_referencing;
use std::time::Duration;

use super::normalize::{to_rgb24, DeviceFormat};
use super::{SourceCounters, SourceError, SourceInfo, SourceMetrics, SourceSpec};
use crate::frame::Frame;

pub struct DeviceSource {
    spec: SourceSpec,
    state: Option<DeviceState>,
    counters: SourceCounters,
    format: DeviceFormat,
    width: u32,
    height: u32,
    seq: u64,
    last_error: Option<String>,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

/// `/dev/videoN` paths pass through; bare indices such as `0` map to `/dev/video0`.
pub fn device_path(uri: &str) -> String {
    let trimmed = uri.trim_start_matches("file://");
    if trimmed.chars().all(|c| c.is_ascii_digit()) && !trimmed.is_empty() {
        format!("/dev/video{}", trimmed)
    } else {
        trimmed.to_string()
    }
}

impl DeviceSource {
    pub fn new(spec: SourceSpec) -> Self {
        Self {
            width: spec.width,
            height: spec.height,
            spec,
            state: None,
            counters: SourceCounters::default(),
            format: DeviceFormat::Rgb24,
            seq: 0,
            last_error: None,
        }
    }

    pub fn open(&mut self) -> Result<(), SourceError> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let path = device_path(&self.spec.uri);
        let mut device = v4l::Device::with_path(&path).map_err(|err| {
            log::warn!("DeviceSource: open {} failed: {}", path, err);
            SourceError::ConnectTimeout
        })?;
        let mut format = device.format().map_err(|_| SourceError::NoVideoStream)?;
        if self.spec.width > 0 && self.spec.height > 0 {
            format.width = self.spec.width;
            format.height = self.spec.height;
        }
        format.fourcc = v4l::FourCC::new(b"RGB3");
        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("DeviceSource: failed to set format on {}: {}", path, err);
                device.format().map_err(|_| SourceError::NoVideoStream)?
            }
        };
        self.format =
            DeviceFormat::from_fourcc(&format.fourcc.repr).ok_or(SourceError::UnsupportedCodec)?;

        if self.spec.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.spec.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("DeviceSource: failed to set fps on {}: {}", path, err);
            }
        }
        self.width = format.width;
        self.height = format.height;

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .context("create v4l2 buffer stream")
            },
        }
        .try_build()
        .map_err(|err| {
            log::warn!("DeviceSource: {:#}", err);
            SourceError::NoVideoStream
        })?;
        self.state = Some(state);
        self.last_error = None;
        self.counters.mark_open();
        Ok(())
    }

    pub fn read(&mut self, _timeout: Duration) -> Result<Frame, SourceError> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().ok_or(SourceError::NotOpen)?;
        let raw = state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|err| {
                self.last_error = Some(err.to_string());
                SourceError::ReadTimeout
            })?;
        self.counters.frame_in();
        let pixels = to_rgb24(&raw, self.width, self.height, self.format).map_err(|err| {
            log::warn!("DeviceSource: {:#}", err);
            SourceError::ReadTimeout
        })?;
        self.seq += 1;
        let frame =
            Frame::new(pixels, self.width, self.height, self.seq).map_err(|_| SourceError::ReadTimeout)?;
        self.counters.frame_out();
        Ok(frame)
    }

    pub fn info(&self) -> SourceInfo {
        SourceInfo {
            width: self.width,
            height: self.height,
            fps: self.spec.target_fps as f32,
            codec: Some(format!("{:?}", self.format).to_lowercase()),
            transport: None,
        }
    }

    pub fn metrics(&self) -> SourceMetrics {
        self.counters.snapshot()
    }

    pub fn is_healthy(&self) -> bool {
        self.state.is_some() && self.last_error.is_none()
    }

    pub fn close(&mut self) {
        self.state = None;
    }
}
