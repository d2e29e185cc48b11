//! HTTP multipart MJPEG source.
//!
//! A reader thread pulls the response body in small chunks, cuts JPEG images out of
//! it by their SOI/EOI markers and keeps only the newest one. Decoding happens on
//! `read()`, so frames that are never consumed are never decoded.

use anyhow::{Context, Result};
use image::GenericImageView;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::{SourceCounters, SourceError, SourceInfo, SourceMetrics, SourceSpec};
use crate::frame::{Frame, FrameQueue};
use crate::signal::{join_with_timeout, StopSignal};

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const CHUNK_SIZE: usize = 1024;
const BODY_READ_TIMEOUT: Duration = Duration::from_secs(2);
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

pub struct MjpegSource {
    spec: SourceSpec,
    queue: Arc<FrameQueue<Vec<u8>>>,
    counters: Arc<SourceCounters>,
    stream_alive: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<String>>>,
    stop: StopSignal,
    reader: Option<JoinHandle<()>>,
    width: u32,
    height: u32,
    seq: u64,
}

impl MjpegSource {
    pub fn new(spec: SourceSpec) -> Self {
        Self {
            spec,
            queue: Arc::new(FrameQueue::new(1)),
            counters: Arc::new(SourceCounters::default()),
            stream_alive: Arc::new(AtomicBool::new(false)),
            last_error: Arc::new(Mutex::new(None)),
            stop: StopSignal::new(),
            reader: None,
            width: 0,
            height: 0,
            seq: 0,
        }
    }

    pub fn open(&mut self) -> Result<(), SourceError> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(self.spec.open_timeout)
            .timeout_read(BODY_READ_TIMEOUT)
            .build();
        let response = match agent.get(&self.spec.uri).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                log::warn!("MjpegSource: server answered HTTP {}", code);
                return Err(status_error(code));
            }
            Err(ureq::Error::Transport(err)) => {
                log::warn!("MjpegSource: connect failed: {}", err);
                return Err(SourceError::ConnectTimeout);
            }
        };
        // ureq treats 4xx/5xx as errors above; anything else non-2xx is still unusable.
        if response.status() >= 400 {
            return Err(status_error(response.status()));
        }

        self.stop = StopSignal::new();
        self.queue.clear();
        self.stream_alive.store(true, Ordering::SeqCst);
        self.counters.mark_open();
        let body = response.into_reader();
        let queue = self.queue.clone();
        let counters = self.counters.clone();
        let alive = self.stream_alive.clone();
        let last_error = self.last_error.clone();
        let stop = self.stop.clone();
        let handle = std::thread::Builder::new()
            .name("mjpeg-reader".to_string())
            .spawn(move || {
                let outcome = pump_body(body, &queue, &counters, &stop);
                alive.store(false, Ordering::SeqCst);
                if let Err(err) = outcome {
                    if let Ok(mut slot) = last_error.lock() {
                        *slot = Some(format!("{:#}", err));
                    }
                }
            })
            .map_err(|err| {
                log::warn!("MjpegSource: failed to spawn reader: {}", err);
                SourceError::ConnectTimeout
            })?;
        self.reader = Some(handle);
        Ok(())
    }

    pub fn read(&mut self, timeout: Duration) -> Result<Frame, SourceError> {
        if self.reader.is_none() {
            return Err(SourceError::NotOpen);
        }
        let jpeg = self
            .queue
            .pop_latest_timeout(timeout)
            .ok_or(SourceError::ReadTimeout)?;
        let (pixels, width, height) = decode_jpeg(&jpeg).map_err(|err| {
            log::warn!("MjpegSource: {:#}", err);
            SourceError::ReadTimeout
        })?;
        self.width = width;
        self.height = height;
        self.seq += 1;
        let frame = Frame::new(pixels, width, height, self.seq).map_err(|err| {
            log::warn!("MjpegSource: {:#}", err);
            SourceError::ReadTimeout
        })?;
        self.counters.frame_out();
        Ok(frame)
    }

    pub fn info(&self) -> SourceInfo {
        SourceInfo {
            width: self.width,
            height: self.height,
            fps: 0.0,
            codec: Some("mjpeg".to_string()),
            transport: None,
        }
    }

    pub fn metrics(&self) -> SourceMetrics {
        self.counters.snapshot()
    }

    pub fn is_healthy(&self) -> bool {
        self.stream_alive.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn close(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.reader.take() {
            // The reader notices the stop flag within one body read timeout.
            if let Err(err) = join_with_timeout(handle, READER_JOIN_TIMEOUT, "mjpeg reader") {
                log::warn!("MjpegSource: {}", err);
            }
        }
        self.stream_alive.store(false, Ordering::SeqCst);
        self.queue.clear();
    }
}

fn status_error(code: u16) -> SourceError {
    if code == 406 {
        SourceError::NoVideoStream
    } else {
        SourceError::ConnectTimeout
    }
}

fn pump_body(
    mut body: impl Read,
    queue: &FrameQueue<Vec<u8>>,
    counters: &SourceCounters,
    stop: &StopSignal,
) -> Result<()> {
    let mut scanner = MjpegScanner::default();
    let mut chunk = [0u8; CHUNK_SIZE];
    while !stop.is_stopped() {
        let read = match body.read(&mut chunk) {
            Ok(0) => anyhow::bail!("mjpeg stream ended"),
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context("read mjpeg chunk"),
        };
        for jpeg in scanner.feed(&chunk[..read]) {
            queue.push(jpeg);
            counters.frame_in();
        }
    }
    Ok(())
}

/// Splits a byte stream into JPEG images delimited by `FFD8` ... `FFD9`.
///
/// Each byte is examined about once: the search resumes where the previous chunk
/// left off, one byte early so a marker split across chunks is still found.
#[derive(Default)]
pub struct MjpegScanner {
    buffer: Vec<u8>,
    /// Offset of the current image's SOI marker.
    start: Option<usize>,
    scan_from: usize,
}

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

impl MjpegScanner {
    /// Appends `bytes` and returns every complete image now available, oldest first.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            let start = match self.start {
                Some(start) => start,
                None => match find_marker(&self.buffer, self.scan_from, SOI) {
                    Some(start) => {
                        self.start = Some(start);
                        self.scan_from = start + 2;
                        start
                    }
                    None => {
                        // Nothing before the last byte can begin an image.
                        let keep_from = self.buffer.len().saturating_sub(1);
                        self.buffer.drain(..keep_from);
                        self.scan_from = 0;
                        break;
                    }
                },
            };
            match find_marker(&self.buffer, self.scan_from, EOI) {
                Some(eoi) => {
                    let end = eoi + 2;
                    frames.push(self.buffer[start..end].to_vec());
                    self.buffer.drain(..end);
                    self.start = None;
                    self.scan_from = 0;
                }
                None => {
                    self.scan_from = self.buffer.len().saturating_sub(1).max(start + 2);
                    break;
                }
            }
        }
        if self.buffer.len() > MAX_JPEG_BYTES * 2 {
            // Unterminated garbage; keep a possible marker byte at the tail.
            let drain_len = self.buffer.len() - 1;
            self.buffer.drain(..drain_len);
            self.start = None;
            self.scan_from = 0;
        }
        frames
    }
}

fn find_marker(buffer: &[u8], from: usize, marker: [u8; 2]) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(2)
        .position(|w| w == marker)
        .map(|at| from + at)
}

fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    Ok((image.into_rgb8().into_raw(), width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanner_splits_multipart_body() {
        let mut scanner = MjpegScanner::default();
        let part = |payload: u8| {
            let mut bytes = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
            bytes.extend_from_slice(&[0xFF, 0xD8, payload, payload, 0xFF, 0xD9]);
            bytes.extend_from_slice(b"\r\n");
            bytes
        };
        let mut body = part(1);
        body.extend(part(2));

        let (head, tail) = body.split_at(20);
        assert!(scanner.feed(head).is_empty());
        let frames = scanner.feed(tail);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], vec![0xFF, 0xD8, 1, 1, 0xFF, 0xD9]);
        assert_eq!(frames[1][2], 2);
    }

    #[test]
    fn scanner_waits_for_end_marker() {
        let mut scanner = MjpegScanner::default();
        assert!(scanner.feed(&[0x00, 0xFF, 0xD8, 0x10]).is_empty());
        let frames = scanner.feed(&[0xFF, 0xD9]);
        assert_eq!(frames, vec![vec![0xFF, 0xD8, 0x10, 0xFF, 0xD9]]);
    }

    #[test]
    fn scanner_finds_markers_split_across_chunks() {
        let mut scanner = MjpegScanner::default();
        let mut frames = Vec::new();
        for byte in [0x00, 0xFF, 0xD8, 0x01, 0xFF, 0xD9, 0xFF, 0xD8, 0x02, 0xFF, 0xD9] {
            frames.extend(scanner.feed(&[byte]));
        }
        assert_eq!(
            frames,
            vec![
                vec![0xFF, 0xD8, 0x01, 0xFF, 0xD9],
                vec![0xFF, 0xD8, 0x02, 0xFF, 0xD9],
            ]
        );
    }

    #[test]
    fn scanner_resumes_instead_of_rescanning() {
        let mut image = vec![0xFF, 0xD8];
        image.resize(300 * 1024, 0x55);
        image.extend_from_slice(&[0xFF, 0xD9]);

        let mut scanner = MjpegScanner::default();
        let mut frames = Vec::new();
        for _ in 0..25 {
            for chunk in image.chunks(CHUNK_SIZE) {
                frames.extend(scanner.feed(chunk));
                if scanner.start.is_some() {
                    // The next chunk is searched from one byte before its start.
                    assert!(scanner.scan_from + 1 >= scanner.buffer.len());
                }
            }
        }
        assert_eq!(frames.len(), 25);
        assert!(frames.iter().all(|frame| frame == &image));
        assert!(scanner.buffer.is_empty());
    }

    #[test]
    fn scanner_drops_leading_garbage() {
        let mut scanner = MjpegScanner::default();
        assert!(scanner.feed(&[0x10; 4096]).is_empty());
        assert!(scanner.buffer.len() <= 1);
        let frames = scanner.feed(&[0xFF, 0xD8, 0x07, 0xFF, 0xD9]);
        assert_eq!(frames, vec![vec![0xFF, 0xD8, 0x07, 0xFF, 0xD9]]);
    }

    #[test]
    fn status_codes_map_to_source_errors() {
        assert_eq!(status_error(406), SourceError::NoVideoStream);
        assert_eq!(status_error(404), SourceError::ConnectTimeout);
        assert_eq!(status_error(503), SourceError::ConnectTimeout);
    }

    #[test]
    fn pump_keeps_only_latest_frame() {
        let mut body = Vec::new();
        for payload in 0..5u8 {
            body.extend_from_slice(&[0xFF, 0xD8, payload, 0xFF, 0xD9]);
        }
        let queue = FrameQueue::new(1);
        let counters = SourceCounters::default();
        let err = pump_body(body.as_slice(), &queue, &counters, &StopSignal::new()).unwrap_err();
        assert!(err.to_string().contains("ended"));
        assert_eq!(queue.pop_latest(), Some(vec![0xFF, 0xD8, 4, 0xFF, 0xD9]));
        assert_eq!(counters.snapshot().frames_in, 5);
    }
}
