//! Line-crossing counter with bounce suppression.
//!
//! Each track's side of the counting line is the sign of the 2D cross product of the
//! line vector and the vector to the box centre. Points within the hysteresis band
//! count as "on the line" and never change a track's side. A side change is only
//! counted when the track spent at least `min_frames` consecutive frames on the side
//! it is leaving and travelled at least `min_travel_px` while there, so a box
//! jittering across the line does not inflate the counts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::events::Direction;
use crate::detect::{BBox, ObjectClass};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Vertical,
    Horizontal,
}

/// Counting line placement relative to the frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineConfig {
    pub orientation: Orientation,
    /// Position as a fraction of frame width (vertical) or height (horizontal).
    pub ratio: f32,
    /// Swap in/out.
    pub reverse: bool,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            orientation: Orientation::Vertical,
            ratio: 0.5,
            reverse: false,
        }
    }
}

/// Segment `(x1, y1) -> (x2, y2)` in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Line {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Line {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Concrete line for a frame. Vertical lines run bottom to top and horizontal
    /// lines left to right, so left→right and top→bottom are both the `in` direction.
    pub fn for_frame(config: &LineConfig, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        match config.orientation {
            Orientation::Vertical => {
                let x = (w * config.ratio).floor();
                Line::new(x, h, x, 0.0)
            }
            Orientation::Horizontal => {
                let y = (h * config.ratio).floor();
                Line::new(0.0, y, w, y)
            }
        }
    }

    fn length(&self) -> f32 {
        ((self.x2 - self.x1).powi(2) + (self.y2 - self.y1).powi(2)).sqrt()
    }
}

/// Side of `line` the centre of `bbox` lies on: -1, 1, or 0 within `eps` pixels.
pub fn side_of_line(bbox: &BBox, line: &Line, eps: f32) -> i8 {
    let (px, py) = bbox.center();
    let dx = line.x2 - line.x1;
    let dy = line.y2 - line.y1;
    let cross = dx * (py - line.y1) - dy * (px - line.x1);
    let length = line.length();
    let distance = if length > 0.0 { cross / length } else { cross };
    if distance.abs() <= eps.max(f32::EPSILON) {
        0
    } else if distance > 0.0 {
        1
    } else {
        -1
    }
}

/// Direction implied by a side change; on-line sides never produce one.
pub fn cross_events(prev: i8, curr: i8) -> Option<Direction> {
    match (prev, curr) {
        (-1, 1) => Some(Direction::In),
        (1, -1) => Some(Direction::Out),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrossingConfig {
    pub hysteresis_px: f32,
    pub min_travel_px: f32,
    pub min_frames: u32,
    /// Seconds before the same (track, direction) may count again.
    pub cooldown_secs: f64,
}

impl Default for CrossingConfig {
    fn default() -> Self {
        Self {
            hysteresis_px: 15.0,
            min_travel_px: 10.0,
            min_frames: 2,
            cooldown_secs: 2.0,
        }
    }
}

/// Entry/exit totals. `inside()` never goes negative.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub entered: u64,
    pub exited: u64,
}

impl Counts {
    pub fn inside(&self) -> u64 {
        self.entered.saturating_sub(self.exited)
    }

    pub fn record(&mut self, direction: Direction) {
        match direction {
            Direction::In => self.entered += 1,
            Direction::Out => self.exited += 1,
        }
    }
}

#[derive(Clone, Debug)]
struct SideRun {
    side: i8,
    frames: u32,
    anchor: (f32, f32),
    travel: f32,
    last_seen: f64,
}

pub struct LineCounter {
    line: LineConfig,
    config: CrossingConfig,
    runs: HashMap<u64, SideRun>,
    last_counted: HashMap<(u64, Direction), f64>,
    counts: HashMap<ObjectClass, Counts>,
}

impl LineCounter {
    pub fn new(line: LineConfig, config: CrossingConfig) -> Self {
        Self {
            line,
            config,
            runs: HashMap::new(),
            last_counted: HashMap::new(),
            counts: HashMap::new(),
        }
    }

    pub fn set_line(&mut self, line: LineConfig) {
        if line != self.line {
            self.line = line;
            self.runs.clear();
        }
    }

    /// Feeds one observation of `track_id`; returns the counted direction, if any.
    pub fn update(
        &mut self,
        track_id: u64,
        class: ObjectClass,
        bbox: &BBox,
        frame_width: u32,
        frame_height: u32,
        now: f64,
    ) -> Option<Direction> {
        let line = Line::for_frame(&self.line, frame_width, frame_height);
        let side = side_of_line(bbox, &line, self.config.hysteresis_px);
        let center = bbox.center();

        let Some(run) = self.runs.get_mut(&track_id) else {
            if side != 0 {
                self.runs.insert(
                    track_id,
                    SideRun {
                        side,
                        frames: 1,
                        anchor: center,
                        travel: 0.0,
                        last_seen: now,
                    },
                );
            }
            return None;
        };
        run.last_seen = now;
        if side == 0 {
            return None;
        }
        if side == run.side {
            run.frames += 1;
            let travel = distance(run.anchor, center);
            run.travel = run.travel.max(travel);
            return None;
        }

        let settled =
            run.frames >= self.config.min_frames && run.travel >= self.config.min_travel_px;
        let previous = run.side;
        *run = SideRun {
            side,
            frames: 1,
            anchor: center,
            travel: 0.0,
            last_seen: now,
        };
        if !settled {
            return None;
        }

        let mut direction = cross_events(previous, side)?;
        if self.line.reverse {
            direction = direction.flipped();
        }
        let key = (track_id, direction);
        if let Some(last) = self.last_counted.get(&key) {
            if now - last < self.config.cooldown_secs {
                return None;
            }
        }
        self.last_counted.insert(key, now);
        self.counts.entry(class).or_default().record(direction);
        Some(direction)
    }

    pub fn counts(&self, class: ObjectClass) -> Counts {
        self.counts.get(&class).copied().unwrap_or_default()
    }

    /// Forgets tracks not seen for more than `idle_secs`.
    pub fn prune(&mut self, now: f64, idle_secs: f64) {
        self.runs.retain(|_, run| now - run.last_seen <= idle_secs);
        let live = &self.runs;
        self.last_counted
            .retain(|(track_id, _), at| live.contains_key(track_id) || now - *at <= idle_secs);
    }

    pub fn tracked(&self) -> usize {
        self.runs.len()
    }
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}
