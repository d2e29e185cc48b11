//! Crossline
//!
//! Resilient multi-camera ingest with per-camera supervision and line-crossing counts.
//!
//! # Architecture
//!
//! Each camera runs as an isolated pipeline:
//!
//! 1. **Ingest**: a `FrameSource` opened through `open_capture`, which walks the
//!    backend priority list and retries RTSP over UDP when TCP fails.
//! 2. **Capture**: a `CaptureWorker` thread reads frames, applies frame skipping,
//!    refreshes the camera's frame cache and feeds a drop-oldest `FrameQueue`.
//! 3. **Processing**: detection, tracking, zone events and line counting on the
//!    newest queued frame, with events handed to an `EventSink`.
//!
//! `CameraManager` owns the pipelines. It gates starts through a per-camera
//! circuit breaker with jittered exponential backoff, serves snapshots from the
//! cache or a short-lived probe, and publishes breaker status to a `StatusStore`.
//! The `Watchdog` flags pipelines that stop producing frames.
//!
//! # Module Structure
//!
//! - `ingest`: frame sources and the open/fallback policy
//! - `frame`: decoded frames and the bounded frame queue
//! - `capture`: capture worker, frame cache, skip control
//! - `detect`: detector and embedder seams plus built-in backends
//! - `track`: tracker, zones, line counter, crossing events
//! - `pipeline`: per-camera capture + processing threads
//! - `overlay`: line, track and count annotations on streamed frames
//! - `manager`: circuit breaker and camera lifecycle
//! - `storage`: status store and event sinks (sqlite, memory, log)
//! - `config`: file + environment configuration

pub mod backoff;
pub mod capture;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod manager;
pub mod overlay;
pub mod pipeline;
pub mod signal;
pub mod storage;
pub mod track;
pub mod watchdog;

/// Camera identifier as used in configuration, logs and stored records.
pub type CameraId = u32;

pub use backoff::Backoff;
pub use capture::{CaptureHealth, CaptureSettings, CaptureWorker, FrameCache};
pub use config::{CameraConfig, CrosslineConfig};
pub use detect::{BBox, Detection, Detector, DetectorRegistry, Embedder, Embedding, ObjectClass};
pub use frame::{Frame, FrameQueue};
pub use ingest::{
    open_capture, Backend, CaptureError, FrameSource, SourceError, SourceKind, SourceSpec,
    Transport,
};
pub use manager::{
    BreakerPolicy, BreakerState, CameraManager, SnapshotResult, StartOutcome, StartTicket,
};
pub use overlay::Overlay;
pub use pipeline::{Pipeline, PipelineFactory};
pub use storage::{
    CameraStatus, InMemoryStatusStore, SqliteEventSink, SqliteStatusStore, StatusStore,
};
pub use track::{CrossingEvent, Direction, EventSink, LineCounter, Tracker};
pub use watchdog::{Heartbeat, Watchdog};
