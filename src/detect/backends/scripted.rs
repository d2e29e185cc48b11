use anyhow::Result;
use std::collections::VecDeque;

use crate::detect::backend::Detector;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Replays a fixed list of per-frame detections, then reports nothing.
#[derive(Default)]
pub struct ScriptedDetector {
    script: VecDeque<Vec<Detection>>,
}

impl ScriptedDetector {
    pub fn new(script: impl IntoIterator<Item = Vec<Detection>>) -> Self {
        Self {
            script: script.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl Detector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _frame: &Frame, min_confidence: f32) -> Result<Vec<Detection>> {
        let mut detections = self.script.pop_front().unwrap_or_default();
        detections.retain(|d| d.confidence >= min_confidence);
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::{BBox, ObjectClass};

    #[test]
    fn replays_then_goes_quiet() -> Result<()> {
        let frame = Frame::new(vec![0u8; 12], 2, 2, 1)?;
        let strong = Detection::new(BBox::new(0.0, 0.0, 1.0, 1.0), ObjectClass::Person, 0.9);
        let weak = Detection::new(BBox::new(0.0, 0.0, 1.0, 1.0), ObjectClass::Person, 0.1);
        let mut detector = ScriptedDetector::new(vec![vec![strong.clone(), weak]]);

        assert_eq!(detector.detect(&frame, 0.5)?, vec![strong]);
        assert!(detector.detect(&frame, 0.5)?.is_empty());
        assert_eq!(detector.remaining(), 0);
        Ok(())
    }
}
