//! Detection and embedding capabilities consumed by the processing stage.
//!
//! Real models live outside this crate; they plug in through `Detector` and
//! `Embedder`. The built-in backends cover tests (`ScriptedDetector`) and a
//! model-free daemon (`MotionDetector`).

mod backend;
mod backends;
mod registry;
mod result;

pub use backend::{Detector, Embedder};
pub use backends::{MotionDetector, ScriptedDetector};
pub use registry::{DetectorFactory, DetectorRegistry};
pub use result::{cosine_similarity, BBox, Detection, Embedding, ObjectClass};
