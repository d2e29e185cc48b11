//! Annotations drawn on streamed frames: the counting line, live track boxes with
//! their ids, and the in/out totals.
//!
//! Drawing is plain pixel work on an `image::RgbImage` with a 5x7 bitmap font, so
//! no font or raster crate beyond `image` is needed.

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};

use crate::detect::{BBox, ObjectClass};
use crate::frame::Frame;
use crate::track::{Counts, Line, LineConfig};

pub const LINE_COLOR: Rgb<u8> = Rgb([255, 215, 0]);
const BOX_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const PANEL_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const GLYPH_ADVANCE: i32 = 6;
const GLYPH_HEIGHT: i32 = 7;

#[derive(Clone, Debug, PartialEq)]
pub struct TrackBox {
    pub id: u64,
    pub class: ObjectClass,
    pub bbox: BBox,
}

/// What one processing step knows about the scene.
#[derive(Clone, Debug, Default)]
pub struct Overlay {
    pub line: LineConfig,
    pub tracks: Vec<TrackBox>,
    pub counts: Vec<(ObjectClass, Counts)>,
}

impl Overlay {
    /// Copy of `frame` with the annotations drawn on it.
    pub fn render(&self, frame: &Frame) -> Result<Frame> {
        let mut image = RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?;
        self.draw(&mut image);
        let mut annotated = Frame::new(image.into_raw(), frame.width, frame.height, frame.seq)?;
        annotated.captured_at = frame.captured_at;
        annotated.wall_clock = frame.wall_clock;
        Ok(annotated)
    }

    fn draw(&self, image: &mut RgbImage) {
        let line = Line::for_frame(&self.line, image.width(), image.height());
        draw_line(image, &line, LINE_COLOR);

        for track in &self.tracks {
            let (x1, y1, x2, y2) = (
                track.bbox.x1.round() as i32,
                track.bbox.y1.round() as i32,
                track.bbox.x2.round() as i32,
                track.bbox.y2.round() as i32,
            );
            draw_rectangle(image, x1, y1, x2, y2, BOX_COLOR);
            let label = format!("{} {}", track.class, track.id);
            let label_y = (y1 - GLYPH_HEIGHT - 3).max(0);
            fill_rect(image, x1, label_y, x1 + text_width(&label) + 2, label_y + GLYPH_HEIGHT + 1, PANEL_COLOR);
            draw_label(image, x1 + 1, label_y + 1, &label, TEXT_COLOR);
        }

        let mut y = 2;
        for (class, counts) in &self.counts {
            let text = format!(
                "{} IN {} OUT {} INSIDE {}",
                class,
                counts.entered,
                counts.exited,
                counts.inside()
            );
            fill_rect(image, 2, y, 4 + text_width(&text), y + GLYPH_HEIGHT + 1, PANEL_COLOR);
            draw_label(image, 3, y + 1, &text, TEXT_COLOR);
            y += GLYPH_HEIGHT + 4;
        }
    }
}

fn text_width(text: &str) -> i32 {
    text.chars().count() as i32 * GLYPH_ADVANCE
}

fn put(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

/// Two pixels thick so the line survives JPEG encoding.
fn draw_line(image: &mut RgbImage, line: &Line, color: Rgb<u8>) {
    let (x0, y0) = (line.x1.round() as i32, line.y1.round() as i32);
    let (x1, y1) = (line.x2.round() as i32, line.y2.round() as i32);
    let steps = (x1 - x0).abs().max((y1 - y0).abs()).max(1);
    let vertical = (x1 - x0).abs() < (y1 - y0).abs();
    for step in 0..=steps {
        let x = x0 + (x1 - x0) * step / steps;
        let y = y0 + (y1 - y0) * step / steps;
        for offset in [-1, 0] {
            if vertical {
                put(image, x + offset, y, color);
            } else {
                put(image, x, y + offset, color);
            }
        }
    }
}

fn draw_rectangle(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    for x in left..=right {
        put(image, x, top, color);
        put(image, x, bottom, color);
    }
    for y in top..=bottom {
        put(image, left, y, color);
        put(image, right, y, color);
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let right = right.min(image.width() as i32 - 1);
    let bottom = bottom.min(image.height() as i32 - 1);
    for y in top.max(0)..=bottom {
        for x in left.max(0)..=right {
            put(image, x, y, color);
        }
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    for ch in text.chars().flat_map(char::to_uppercase) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        put(image, x + col, y + row as i32, color);
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b11011, 0b10001],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        _ => return None,
    };
    Some(bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::Orientation;

    fn black(width: u32, height: u32) -> Frame {
        Frame::new(vec![0u8; (width * height * 3) as usize], width, height, 7).unwrap()
    }

    fn pixel(frame: &Frame, x: u32, y: u32) -> [u8; 3] {
        let at = ((y * frame.width + x) * 3) as usize;
        let px = &frame.pixels()[at..at + 3];
        [px[0], px[1], px[2]]
    }

    #[test]
    fn vertical_line_is_drawn_at_ratio() -> Result<()> {
        let frame = black(100, 80);
        let overlay = Overlay::default();
        let annotated = overlay.render(&frame)?;
        assert_eq!(annotated.seq, 7);
        for y in 0..80 {
            assert_eq!(pixel(&annotated, 50, y), LINE_COLOR.0, "y = {}", y);
        }
        assert_eq!(pixel(&annotated, 10, 40), [0, 0, 0]);
        assert_eq!(pixel(&frame, 50, 40), [0, 0, 0]);
        Ok(())
    }

    #[test]
    fn horizontal_line_and_track_box() -> Result<()> {
        let frame = black(120, 100);
        let overlay = Overlay {
            line: LineConfig {
                orientation: Orientation::Horizontal,
                ratio: 0.75,
                reverse: false,
            },
            tracks: vec![TrackBox {
                id: 3,
                class: ObjectClass::Person,
                bbox: BBox::new(40.0, 30.0, 70.0, 60.0),
            }],
            counts: Vec::new(),
        };
        let annotated = overlay.render(&frame)?;
        assert_eq!(pixel(&annotated, 5, 75), LINE_COLOR.0);
        assert_eq!(pixel(&annotated, 40, 45), BOX_COLOR.0);
        assert_eq!(pixel(&annotated, 70, 45), BOX_COLOR.0);
        assert_eq!(pixel(&annotated, 55, 45), [0, 0, 0]);
        Ok(())
    }

    #[test]
    fn counts_panel_is_drawn_top_left() -> Result<()> {
        let frame = black(200, 60);
        let overlay = Overlay {
            line: LineConfig {
                ratio: 0.9,
                ..LineConfig::default()
            },
            tracks: Vec::new(),
            counts: vec![(
                ObjectClass::Person,
                Counts {
                    entered: 2,
                    exited: 1,
                },
            )],
        };
        let annotated = overlay.render(&frame)?;
        let lit = (2..60u32)
            .flat_map(|x| (2..11u32).map(move |y| (x, y)))
            .filter(|&(x, y)| pixel(&annotated, x, y) == TEXT_COLOR.0)
            .count();
        assert!(lit > 20, "only {} text pixels", lit);
        Ok(())
    }
}
