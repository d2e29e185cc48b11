pub mod motion;
pub mod scripted;

pub use motion::MotionDetector;
pub use scripted::ScriptedDetector;
