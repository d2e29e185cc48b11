use anyhow::Result;

use crate::detect::backend::Detector;
use crate::detect::result::{BBox, Detection, ObjectClass};
use crate::frame::Frame;

/// Frame-differencing detector: reports the bounding box of changed pixels as one
/// detection. Good enough to drive line counting without a model.
pub struct MotionDetector {
    class: ObjectClass,
    pixel_threshold: u8,
    /// Minimum share of changed pixels before anything is reported.
    min_changed_ratio: f32,
    previous: Option<(u32, u32, Vec<u8>)>,
}

impl MotionDetector {
    pub fn new(class: ObjectClass) -> Self {
        Self {
            class,
            pixel_threshold: 25,
            min_changed_ratio: 0.002,
            previous: None,
        }
    }
}

impl Default for MotionDetector {
    fn default() -> Self {
        Self::new(ObjectClass::Person)
    }
}

impl Detector for MotionDetector {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn detect(&mut self, frame: &Frame, min_confidence: f32) -> Result<Vec<Detection>> {
        let gray = frame.to_gray();
        let previous = self.previous.replace((frame.width, frame.height, gray));
        let Some((pw, ph, prev)) = previous else {
            return Ok(Vec::new());
        };
        let Some((_, _, gray)) = self.previous.as_ref() else {
            return Ok(Vec::new());
        };
        if (pw, ph) != (frame.width, frame.height) {
            return Ok(Vec::new());
        }

        let width = frame.width as usize;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (usize::MAX, usize::MAX, 0, 0);
        let mut changed = 0usize;
        for (i, (a, b)) in gray.iter().zip(&prev).enumerate() {
            if a.abs_diff(*b) < self.pixel_threshold {
                continue;
            }
            changed += 1;
            let (x, y) = (i % width, i / width);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }

        let ratio = changed as f32 / gray.len().max(1) as f32;
        if ratio < self.min_changed_ratio {
            return Ok(Vec::new());
        }
        let confidence = (0.5 + ratio * 10.0).min(0.95);
        if confidence < min_confidence {
            return Ok(Vec::new());
        }
        let bbox = BBox::new(
            min_x as f32,
            min_y as f32,
            (max_x + 1) as f32,
            (max_y + 1) as f32,
        );
        Ok(vec![Detection::new(bbox, self.class, confidence)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_block(x0: usize) -> Frame {
        let (w, h) = (20usize, 10usize);
        let mut pixels = vec![0u8; w * h * 3];
        for y in 2..6 {
            for x in x0..x0 + 3 {
                let offset = (y * w + x) * 3;
                pixels[offset..offset + 3].copy_from_slice(&[255, 255, 255]);
            }
        }
        Frame::new(pixels, w as u32, h as u32, 1).unwrap()
    }

    #[test]
    fn reports_changed_region() -> Result<()> {
        let mut detector = MotionDetector::default();
        assert!(detector.detect(&frame_with_block(2), 0.3)?.is_empty());

        let detections = detector.detect(&frame_with_block(10), 0.3)?;
        assert_eq!(detections.len(), 1);
        let bbox = detections[0].bbox;
        assert_eq!((bbox.x1, bbox.x2), (2.0, 13.0));
        assert_eq!((bbox.y1, bbox.y2), (2.0, 6.0));

        assert!(detector.detect(&frame_with_block(10), 0.3)?.is_empty());
        Ok(())
    }
}
