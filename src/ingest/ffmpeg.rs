//! External-decoder source: an `ffmpeg` subprocess writing raw RGB24 frames to a pipe.
//!
//! Stream dimensions come from the camera config or from an `ffprobe` run. A reader
//! thread does fixed-size reads into a reusable buffer and hands complete frames to a
//! one-slot drop-oldest queue. `MAX_SHORT_READS` incomplete reads in a row restart the
//! decoder with exponential backoff; a full read resets both counters.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::{SourceCounters, SourceError, SourceInfo, SourceKind, SourceMetrics, SourceSpec};
use crate::backoff::Backoff;
use crate::frame::{rgb_len, Frame, FrameQueue};
use crate::signal::{join_with_timeout, StopSignal};

pub const MAX_SHORT_READS: u32 = 3;
pub const STDERR_LINES: usize = 20;
const DECODER_BACKOFF_BASE: Duration = Duration::from_secs(1);
const DECODER_BACKOFF_MAX: Duration = Duration::from_secs(10);
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct FfmpegSource {
    spec: SourceSpec,
    width: u32,
    height: u32,
    fps: f32,
    codec: Option<String>,
    queue: Arc<FrameQueue<Frame>>,
    decoder: Arc<DecoderHandle>,
    counters: Arc<SourceCounters>,
    stop: StopSignal,
    reader: Option<JoinHandle<()>>,
}

/// State shared between the source and its reader thread.
#[derive(Default)]
struct DecoderHandle {
    child: Mutex<Option<Child>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    running: AtomicBool,
}

impl DecoderHandle {
    fn kill(&self) {
        let Ok(mut guard) = self.child.lock() else {
            return;
        };
        if let Some(mut child) = guard.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn tail(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .map(|lines| lines.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl FfmpegSource {
    pub fn new(spec: SourceSpec) -> Self {
        Self {
            width: spec.width,
            height: spec.height,
            fps: spec.target_fps as f32,
            codec: None,
            spec,
            queue: Arc::new(FrameQueue::new(1)),
            decoder: Arc::new(DecoderHandle::default()),
            counters: Arc::new(SourceCounters::default()),
            stop: StopSignal::new(),
            reader: None,
        }
    }

    pub fn open(&mut self) -> Result<(), SourceError> {
        if self.width == 0 || self.height == 0 {
            let probe = probe_stream(&self.spec)?;
            self.width = probe.width;
            self.height = probe.height;
            if probe.fps > 0.0 {
                self.fps = probe.fps;
            }
            self.codec = probe.codec;
        }
        if self.width == 0 || self.height == 0 {
            return Err(SourceError::NoVideoStream);
        }
        let frame_len = rgb_len(self.width, self.height).map_err(|err| {
            log::warn!(
                "FfmpegSource: unusable stream size {}x{}: {}",
                self.width,
                self.height,
                err
            );
            SourceError::UnsupportedCodec
        })?;

        self.stop = StopSignal::new();
        self.queue.clear();
        let stdout = spawn_decoder(&self.spec, &self.decoder).map_err(|err| {
            log::warn!("FfmpegSource: failed to start decoder: {:#}", err);
            match err.downcast_ref::<std::io::Error>() {
                Some(io) if io.kind() == std::io::ErrorKind::NotFound => {
                    SourceError::UnsupportedCodec
                }
                _ => SourceError::ConnectTimeout,
            }
        })?;
        self.counters.mark_open();

        let reader = ReaderLoop {
            spec: self.spec.clone(),
            frame_len,
            width: self.width,
            height: self.height,
            queue: self.queue.clone(),
            decoder: self.decoder.clone(),
            counters: self.counters.clone(),
            stop: self.stop.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("ffmpeg-reader".to_string())
            .spawn(move || reader.run(stdout))
            .map_err(|err| {
                log::warn!("FfmpegSource: failed to spawn reader thread: {}", err);
                self.decoder.kill();
                SourceError::ConnectTimeout
            })?;
        self.reader = Some(handle);
        Ok(())
    }

    pub fn read(&mut self, timeout: Duration) -> Result<Frame, SourceError> {
        if self.reader.is_none() {
            return Err(SourceError::NotOpen);
        }
        if self.width == 0 || self.height == 0 {
            return Err(SourceError::NoVideoStream);
        }
        match self.queue.pop_latest_timeout(timeout) {
            Some(frame) => {
                self.counters.frame_out();
                Ok(frame)
            }
            None => {
                let tail = self.decoder.tail();
                if !tail.is_empty() {
                    log::debug!("FfmpegSource: decoder stderr:\n{}", tail.join("\n"));
                }
                Err(SourceError::ReadTimeout)
            }
        }
    }

    pub fn info(&self) -> SourceInfo {
        SourceInfo {
            width: self.width,
            height: self.height,
            fps: self.fps,
            codec: self.codec.clone(),
            transport: (self.spec.kind == SourceKind::Rtsp).then_some(self.spec.transport),
        }
    }

    pub fn metrics(&self) -> SourceMetrics {
        self.counters.snapshot()
    }

    pub fn is_healthy(&self) -> bool {
        self.reader.as_ref().is_some_and(|handle| !handle.is_finished())
            && self.decoder.running.load(Ordering::SeqCst)
    }

    pub fn stderr_tail(&self) -> Vec<String> {
        self.decoder.tail()
    }

    pub fn close(&mut self) {
        self.stop.stop();
        // Killing the child unblocks a reader stuck in read().
        self.decoder.kill();
        if let Some(handle) = self.reader.take() {
            if let Err(err) = join_with_timeout(handle, READER_JOIN_TIMEOUT, "ffmpeg reader") {
                log::warn!("FfmpegSource: {}", err);
            }
        }
        self.decoder.running.store(false, Ordering::SeqCst);
        self.queue.clear();
    }
}

struct ReaderLoop {
    spec: SourceSpec,
    frame_len: usize,
    width: u32,
    height: u32,
    queue: Arc<FrameQueue<Frame>>,
    decoder: Arc<DecoderHandle>,
    counters: Arc<SourceCounters>,
    stop: StopSignal,
}

impl ReaderLoop {
    fn run(self, stdout: ChildStdout) {
        let mut stdout = Some(stdout);
        let mut buf = vec![0u8; self.frame_len];
        let mut backoff = Backoff::new(DECODER_BACKOFF_BASE, DECODER_BACKOFF_MAX);
        let mut short_reads = 0u32;
        let mut seq = 0u64;

        while !self.stop.is_stopped() {
            let Some(pipe) = stdout.as_mut() else {
                stdout = self.restart(&mut backoff);
                continue;
            };
            let read = read_full(pipe, &mut buf);
            if read != self.frame_len {
                short_reads += 1;
                if short_reads >= MAX_SHORT_READS && !self.stop.is_stopped() {
                    log::warn!(
                        "FfmpegSource: {} short reads in a row, restarting decoder",
                        short_reads
                    );
                    short_reads = 0;
                    stdout = self.restart(&mut backoff);
                }
                continue;
            }
            short_reads = 0;
            backoff.reset();
            seq += 1;
            match Frame::new(buf.to_vec(), self.width, self.height, seq) {
                Ok(frame) => {
                    self.queue.push(frame);
                    self.counters.frame_in();
                }
                Err(err) => log::warn!("FfmpegSource: dropping frame: {}", err),
            }
        }
        // A restart can race with close(); never leave a decoder behind.
        self.decoder.kill();
    }

    fn restart(&self, backoff: &mut Backoff) -> Option<ChildStdout> {
        self.decoder.kill();
        self.counters.reconnected();
        let delay = backoff.next();
        if self.stop.wait(delay) {
            return None;
        }
        self.queue.clear();
        match spawn_decoder(&self.spec, &self.decoder) {
            Ok(stdout) => Some(stdout),
            Err(err) => {
                log::warn!("FfmpegSource: decoder restart failed: {:#}", err);
                self.decoder.running.store(false, Ordering::SeqCst);
                None
            }
        }
    }
}

/// Reads until `buf` is full, EOF or an error. Returns the number of bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> usize {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    filled
}

/// Starts the decoder, records the child and begins collecting its stderr.
fn spawn_decoder(spec: &SourceSpec, decoder: &DecoderHandle) -> Result<ChildStdout> {
    let mut child = Command::new("ffmpeg")
        .args(build_command_args(spec))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn ffmpeg")?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("ffmpeg stdout not captured"))?;
    if let Some(stderr) = child.stderr.take() {
        let tail = decoder.stderr_tail.clone();
        if let Ok(mut lines) = tail.lock() {
            lines.clear();
        }
        std::thread::Builder::new()
            .name("ffmpeg-stderr".to_string())
            .spawn(move || drain_stderr(stderr, &tail))
            .context("spawn ffmpeg stderr thread")?;
    }
    let mut guard = decoder
        .child
        .lock()
        .map_err(|_| anyhow!("decoder lock poisoned"))?;
    *guard = Some(child);
    decoder.running.store(true, Ordering::SeqCst);
    log::info!(
        "FfmpegSource: decoder started for {}",
        super::redact_uri(&spec.uri)
    );
    Ok(stdout)
}

fn drain_stderr(stderr: impl Read, tail: &Mutex<VecDeque<String>>) {
    for line in BufReader::new(stderr).lines() {
        let Ok(line) = line else {
            break;
        };
        let Ok(mut lines) = tail.lock() else {
            break;
        };
        if lines.len() >= STDERR_LINES {
            lines.pop_front();
        }
        lines.push_back(line.trim_end().to_string());
    }
}

/// Decoder command line. Extra flags land just before `-i`.
pub fn build_command_args(spec: &SourceSpec) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if spec.kind == SourceKind::Rtsp {
        args.extend([
            "-rtsp_transport".to_string(),
            spec.transport.as_str().to_string(),
            "-rw_timeout".to_string(),
            spec.rw_timeout_us.to_string(),
            "-stimeout".to_string(),
            spec.stimeout_us.to_string(),
        ]);
    }
    args.extend(spec.extra_flags.iter().cloned());
    args.extend(["-i".to_string(), spec.uri.clone()]);
    args.extend(
        [
            "-fflags", "nobuffer", "-flags", "low_delay", "-probesize", "32", "-f", "rawvideo",
            "-pix_fmt", "rgb24", "-",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args
}

// ----------------------------------------------------------------------------
// ffprobe
// ----------------------------------------------------------------------------

#[derive(Debug, Default, PartialEq)]
pub struct ProbeResult {
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    pub codec: Option<String>,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
}

fn probe_stream(spec: &SourceSpec) -> Result<ProbeResult, SourceError> {
    let mut args: Vec<String> = vec![
        "-v".into(),
        "error".into(),
        "-show_entries".into(),
        "stream=codec_type,codec_name,width,height,avg_frame_rate".into(),
        "-of".into(),
        "json".into(),
    ];
    if spec.kind == SourceKind::Rtsp {
        args.extend([
            "-rtsp_transport".to_string(),
            spec.transport.as_str().to_string(),
            "-rw_timeout".to_string(),
            spec.rw_timeout_us.to_string(),
        ]);
    }
    args.push(spec.uri.clone());

    let output = match Command::new("ffprobe").args(&args).stdin(Stdio::null()).output() {
        Ok(output) => output,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            log::warn!("FfmpegSource: ffprobe not installed");
            return Err(SourceError::UnsupportedCodec);
        }
        Err(err) => {
            log::warn!("FfmpegSource: ffprobe failed to run: {}", err);
            return Err(SourceError::ConnectTimeout);
        }
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        log::debug!("FfmpegSource: ffprobe stderr: {}", stderr.trim());
        return Err(classify_probe_failure(&stderr));
    }
    parse_probe_output(&output.stdout).ok_or(SourceError::NoVideoStream)
}

/// Maps ffprobe diagnostics to a source error.
pub fn classify_probe_failure(stderr: &str) -> SourceError {
    let lower = stderr.to_ascii_lowercase();
    let network = [
        "timed out",
        "timeout",
        "connection refused",
        "no route to host",
        "network is unreachable",
        "401 unauthorized",
        "name or service not known",
    ];
    if network.iter().any(|needle| lower.contains(needle)) {
        SourceError::ConnectTimeout
    } else if lower.contains("decoder") && lower.contains("not found") {
        SourceError::UnsupportedCodec
    } else {
        SourceError::NoVideoStream
    }
}

/// First video stream in ffprobe JSON output, if any.
pub fn parse_probe_output(raw: &[u8]) -> Option<ProbeResult> {
    let parsed: ProbeOutput = serde_json::from_slice(raw).ok()?;
    let stream = parsed
        .streams
        .into_iter()
        .find(|s| s.codec_type.as_deref().map_or(true, |t| t == "video"))?;
    let width = stream.width.unwrap_or(0);
    let height = stream.height.unwrap_or(0);
    if width == 0 || height == 0 {
        return None;
    }
    Some(ProbeResult {
        width,
        height,
        fps: stream
            .avg_frame_rate
            .as_deref()
            .map(parse_frame_rate)
            .unwrap_or(0.0),
        codec: stream.codec_name,
    })
}

fn parse_frame_rate(value: &str) -> f32 {
    match value.split_once('/') {
        Some((num, den)) => {
            let num: f32 = num.parse().unwrap_or(0.0);
            let den: f32 = den.parse().unwrap_or(0.0);
            if den > 0.0 {
                num / den
            } else {
                0.0
            }
        }
        None => value.parse().unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Transport;

    #[test]
    fn command_places_extra_flags_before_input() {
        let mut spec = SourceSpec::new("rtsp://cam/1", SourceKind::Rtsp).with_transport(Transport::Udp);
        spec.extra_flags = vec!["-hwaccel".to_string(), "auto".to_string()];
        spec.rw_timeout_us = 2_000_000;
        let args = build_command_args(&spec);

        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "rtsp://cam/1");
        assert_eq!(&args[input - 2..input], &["-hwaccel", "auto"]);
        let transport = args.iter().position(|a| a == "-rtsp_transport").unwrap();
        assert_eq!(args[transport + 1], "udp");
        assert!(args.contains(&"2000000".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-"));
        assert!(args.windows(2).any(|w| w == ["-pix_fmt", "rgb24"]));
    }

    #[test]
    fn oversized_dimensions_fail_before_spawning_decoder() {
        let mut spec = SourceSpec::new("rtsp://cam/1", SourceKind::Rtsp);
        spec.width = 100_000;
        spec.height = 100_000;
        let mut source = FfmpegSource::new(spec);
        assert_eq!(source.open(), Err(SourceError::UnsupportedCodec));
        assert!(source.reader.is_none());
    }

    #[test]
    fn non_rtsp_inputs_skip_transport_flags() {
        let spec = SourceSpec::new("http://cam/video", SourceKind::Http);
        let args = build_command_args(&spec);
        assert!(!args.iter().any(|a| a == "-rtsp_transport"));
    }

    #[test]
    fn parses_probe_json() {
        let raw = br#"{"streams":[
            {"codec_type":"audio","codec_name":"aac"},
            {"codec_type":"video","codec_name":"h264","width":1280,"height":720,"avg_frame_rate":"25/1"}
        ]}"#;
        let probe = parse_probe_output(raw).unwrap();
        assert_eq!((probe.width, probe.height), (1280, 720));
        assert_eq!(probe.fps, 25.0);
        assert_eq!(probe.codec.as_deref(), Some("h264"));
    }

    #[test]
    fn probe_without_video_is_none() {
        assert!(parse_probe_output(br#"{"streams":[{"codec_type":"audio"}]}"#).is_none());
        assert!(parse_probe_output(b"not json").is_none());
    }

    #[test]
    fn classifies_probe_failures() {
        assert_eq!(
            classify_probe_failure("rtsp://cam: Connection timed out"),
            SourceError::ConnectTimeout
        );
        assert_eq!(
            classify_probe_failure("Decoder (codec hevc) not found"),
            SourceError::UnsupportedCodec
        );
        assert_eq!(
            classify_probe_failure("Invalid data found when processing input"),
            SourceError::NoVideoStream
        );
    }

    #[test]
    fn short_reads_report_partial_length() {
        let mut data: &[u8] = &[1, 2, 3];
        let mut buf = [0u8; 6];
        assert_eq!(read_full(&mut data, &mut buf), 3);
    }

    #[test]
    fn stderr_ring_is_bounded() {
        let text: String = (0..50).map(|i| format!("line {}\n", i)).collect();
        let tail = Mutex::new(VecDeque::new());
        drain_stderr(text.as_bytes(), &tail);
        let lines = tail.lock().unwrap();
        assert_eq!(lines.len(), STDERR_LINES);
        assert_eq!(lines.back().map(String::as_str), Some("line 49"));
    }
}
