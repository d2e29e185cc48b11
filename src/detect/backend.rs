use anyhow::Result;

use crate::detect::result::{Detection, Embedding};
use crate::frame::Frame;

/// Object detector.
///
/// A failing call is treated by the caller as "no detections for this frame"; it
/// never stops the processing loop.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Detections with confidence of at least `min_confidence`, in frame pixel
    /// coordinates.
    fn detect(&mut self, frame: &Frame, min_confidence: f32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Appearance embedding for a detection crop.
///
/// Returning `Ok(None)` means no usable embedding; the tracker then associates on
/// box overlap alone.
pub trait Embedder: Send {
    fn name(&self) -> &'static str;

    fn embed(&mut self, crop: &Frame) -> Result<Option<Embedding>>;
}
