//! Frame-to-frame track association with zone-change events.
//!
//! Detections are matched to live tracks of the same class by IoU and, when both
//! sides carry an embedding, cosine similarity. Each gate must pass on its own;
//! the best combined score wins. A track whose zone changes relative to the
//! configured line emits a debounced `in`/`out` event.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use super::counting::{Counts, LineConfig, Orientation};
use super::events::{CrossingEvent, Direction, EventKind};
use crate::detect::{cosine_similarity, BBox, Detection, Embedding, ObjectClass};
use crate::CameraId;

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.35;
pub const DEFAULT_COUNT_COOLDOWN_SECS: f64 = 2.0;
pub const DEFAULT_TRACK_IDLE_SECS: f64 = 10.0;
pub const DEFAULT_SHARPNESS_SCALE: f64 = 1000.0;

/// Weights of the snapshot quality score.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualityWeights {
    pub confidence: f32,
    pub sharpness: f32,
    pub frontalness: f32,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            confidence: 0.5,
            sharpness: 0.3,
            frontalness: 0.2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    pub iou_threshold: f32,
    pub similarity_threshold: f32,
    pub cooldown_secs: f64,
    pub idle_secs: f64,
    pub weights: QualityWeights,
    /// Laplacian variance that maps to full sharpness.
    pub sharpness_scale: f64,
    /// Detections narrower or shorter than this are ignored.
    pub min_size: f32,
    pub line: LineConfig,
    /// Classes whose zone changes produce events.
    pub zone_classes: Vec<ObjectClass>,
    pub snapshot_dir: PathBuf,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            cooldown_secs: DEFAULT_COUNT_COOLDOWN_SECS,
            idle_secs: DEFAULT_TRACK_IDLE_SECS,
            weights: QualityWeights::default(),
            sharpness_scale: DEFAULT_SHARPNESS_SCALE,
            min_size: 0.0,
            line: LineConfig::default(),
            zone_classes: vec![ObjectClass::Face],
            snapshot_dir: PathBuf::from("snapshots"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    Left,
    Right,
    Top,
    Bottom,
}

impl Zone {
    pub fn as_str(self) -> &'static str {
        match self {
            Zone::Left => "left",
            Zone::Right => "right",
            Zone::Top => "top",
            Zone::Bottom => "bottom",
        }
    }
}

/// Zone of the box centre relative to the line at `floor(dim * ratio)`.
pub fn zone_of(bbox: &BBox, line: &LineConfig, width: u32, height: u32) -> Zone {
    let (cx, cy) = bbox.center();
    match line.orientation {
        Orientation::Vertical => {
            let line_pos = (width as f32 * line.ratio).floor();
            if cx < line_pos {
                Zone::Left
            } else {
                Zone::Right
            }
        }
        Orientation::Horizontal => {
            let line_pos = (height as f32 * line.ratio).floor();
            if cy < line_pos {
                Zone::Top
            } else {
                Zone::Bottom
            }
        }
    }
}

/// Direction of a zone change; left→right or top→bottom enters unless reversed.
pub fn zone_direction(prev: Zone, curr: Zone, line: &LineConfig) -> Option<Direction> {
    if prev == curr {
        return None;
    }
    let entered = match line.orientation {
        Orientation::Vertical => prev == Zone::Left && curr == Zone::Right,
        Orientation::Horizontal => prev == Zone::Top && curr == Zone::Bottom,
    };
    let direction = if entered { Direction::In } else { Direction::Out };
    Some(if line.reverse {
        direction.flipped()
    } else {
        direction
    })
}

/// One detection plus what the processing stage learned about its crop.
#[derive(Clone, Debug)]
pub struct Observation {
    pub detection: Detection,
    pub embedding: Option<Embedding>,
    /// Raw Laplacian variance of the crop.
    pub sharpness: f64,
}

impl Observation {
    pub fn new(detection: Detection) -> Self {
        Self {
            detection,
            embedding: None,
            sharpness: 0.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Track {
    pub id: u64,
    pub class: ObjectClass,
    pub bbox: BBox,
    pub embedding_avg: Option<Vec<f32>>,
    embedding_count: u32,
    pub prev_zone: Option<Zone>,
    pub curr_zone: Option<Zone>,
    pub best_quality: f32,
    pub best_snapshot: Option<String>,
    pub first_seen: f64,
    pub last_seen: f64,
    pub identity: Option<String>,
    pub identity_score: f32,
    pub temp_id: Option<String>,
}

impl Track {
    fn new(id: u64, observation: &Observation, now: f64) -> Self {
        Self {
            id,
            class: observation.detection.class,
            bbox: observation.detection.bbox,
            embedding_avg: None,
            embedding_count: 0,
            prev_zone: None,
            curr_zone: None,
            best_quality: 0.0,
            best_snapshot: None,
            first_seen: now,
            last_seen: now,
            identity: None,
            identity_score: 0.0,
            temp_id: None,
        }
    }

    fn absorb_embedding(&mut self, vector: &[f32]) {
        let n = self.embedding_count as f32;
        match self.embedding_avg.as_mut() {
            Some(avg) if avg.len() == vector.len() => {
                for (a, v) in avg.iter_mut().zip(vector) {
                    *a = (*a * n + v) / (n + 1.0);
                }
                self.embedding_count += 1;
            }
            _ => {
                self.embedding_avg = Some(vector.to_vec());
                self.embedding_count = 1;
            }
        }
    }
}

/// Per-observation result handed back to the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackUpdate {
    pub track_id: u64,
    pub class: ObjectClass,
    pub bbox: BBox,
    pub quality: f32,
    /// Set when this observation became the track's representative image; the
    /// caller stores the crop at `snapshot_ref`.
    pub best_improved: bool,
    pub snapshot_ref: Option<String>,
    pub label: String,
}

#[derive(Clone, Debug, Default)]
pub struct FrameOutcome {
    pub updates: Vec<TrackUpdate>,
    pub events: Vec<CrossingEvent>,
}

pub struct Tracker {
    camera_id: CameraId,
    config: TrackerConfig,
    tracks: BTreeMap<u64, Track>,
    next_id: u64,
    last_counted: HashMap<(u64, Direction), f64>,
    counts: Counts,
}

impl Tracker {
    pub fn new(camera_id: CameraId, config: TrackerConfig) -> Self {
        Self {
            camera_id,
            config,
            tracks: BTreeMap::new(),
            next_id: 1,
            last_counted: HashMap::new(),
            counts: Counts::default(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn set_line(&mut self, line: LineConfig) {
        self.config.line = line;
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn track(&self, id: u64) -> Option<&Track> {
        self.tracks.get(&id)
    }

    /// Zone-event totals.
    pub fn counts(&self) -> Counts {
        self.counts
    }

    /// Processes one frame's observations taken at `now` (unix seconds).
    pub fn update(
        &mut self,
        observations: &[Observation],
        frame_width: u32,
        frame_height: u32,
        now: f64,
    ) -> FrameOutcome {
        let mut outcome = FrameOutcome::default();
        let mut claimed = HashSet::new();

        for observation in observations {
            let bbox = observation.detection.bbox;
            if bbox.width() < self.config.min_size || bbox.height() < self.config.min_size {
                continue;
            }
            let track_id = match self.associate(observation, &claimed) {
                Some(id) => id,
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.insert(id, Track::new(id, observation, now));
                    log::debug!("tracker[{}]: new track {}", self.camera_id, id);
                    id
                }
            };
            claimed.insert(track_id);
            if let Some((update, event)) =
                self.apply(track_id, observation, frame_width, frame_height, now)
            {
                outcome.updates.push(update);
                outcome.events.extend(event);
            }
        }

        self.prune(now);
        outcome
    }

    fn associate(&self, observation: &Observation, claimed: &HashSet<u64>) -> Option<u64> {
        let detection = &observation.detection;
        let embedding = observation.embedding.as_ref().map(|e| e.vector.as_slice());
        let mut best: Option<(u64, f32)> = None;
        for track in self.tracks.values() {
            if track.class != detection.class || claimed.contains(&track.id) {
                continue;
            }
            let iou = detection.bbox.iou(&track.bbox);
            if iou < self.config.iou_threshold {
                continue;
            }
            let similarity = match (embedding, track.embedding_avg.as_deref()) {
                (Some(a), Some(b)) => {
                    let cos = cosine_similarity(a, b);
                    if cos < self.config.similarity_threshold {
                        continue;
                    }
                    cos
                }
                _ => 0.0,
            };
            let score = iou + similarity;
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((track.id, score));
            }
        }
        best.map(|(id, _)| id)
    }

    fn apply(
        &mut self,
        track_id: u64,
        observation: &Observation,
        width: u32,
        height: u32,
        now: f64,
    ) -> Option<(TrackUpdate, Option<CrossingEvent>)> {
        let camera_id = self.camera_id;
        let zone = zone_of(&observation.detection.bbox, &self.config.line, width, height);
        let quality = self.quality(observation);
        let track = self.tracks.get_mut(&track_id)?;

        track.bbox = observation.detection.bbox;
        track.last_seen = now;
        if let Some(embedding) = &observation.embedding {
            track.absorb_embedding(&embedding.vector);
            if track.identity.is_none() {
                if let Some(identity) = &embedding.identity {
                    track.identity = Some(identity.clone());
                    track.identity_score = embedding.score;
                }
            }
        }
        track.prev_zone = track.curr_zone;
        track.curr_zone = Some(zone);

        let best_improved = quality > track.best_quality || track.best_snapshot.is_none();
        if best_improved {
            let name = format!("{}_{}_{}.jpg", now as u64, camera_id, track_id);
            track.best_snapshot = Some(self.config.snapshot_dir.join(name).display().to_string());
            track.best_quality = quality;
        }
        if track.identity.is_none() && track.temp_id.is_none() {
            track.temp_id = Some(temp_id());
        }

        let update = TrackUpdate {
            track_id,
            class: track.class,
            bbox: track.bbox,
            quality,
            best_improved,
            snapshot_ref: track.best_snapshot.clone(),
            label: track.identity.clone().unwrap_or_else(|| "Unknown".to_string()),
        };

        let event = match (track.prev_zone, self.config.zone_classes.contains(&track.class)) {
            (Some(prev), true) => zone_direction(prev, zone, &self.config.line)
                .and_then(|direction| self.debounce(track_id, direction, now))
                .and_then(|direction| self.event_for(track_id, direction, now)),
            _ => None,
        };
        if let Some(event) = &event {
            self.counts.record(event.direction);
        }
        Some((update, event))
    }

    fn debounce(&mut self, track_id: u64, direction: Direction, now: f64) -> Option<Direction> {
        let key = (track_id, direction);
        if let Some(last) = self.last_counted.get(&key) {
            if now - last < self.config.cooldown_secs {
                log::debug!(
                    "tracker[{}]: track {} {} suppressed by cooldown",
                    self.camera_id,
                    track_id,
                    direction
                );
                return None;
            }
        }
        self.last_counted.insert(key, now);
        Some(direction)
    }

    fn event_for(&self, track_id: u64, direction: Direction, now: f64) -> Option<CrossingEvent> {
        let track = self.tracks.get(&track_id)?;
        let kind = EventKind::for_crossing(track.class, direction)?;
        Some(CrossingEvent {
            timestamp: now as u64,
            camera_id: self.camera_id,
            track_id,
            kind,
            direction,
            class: track.class,
            identity: track.identity.clone(),
            temp_id: if track.identity.is_some() {
                None
            } else {
                track.temp_id.clone()
            },
            score: track.identity_score,
            snapshot_ref: track.best_snapshot.clone(),
        })
    }

    fn quality(&self, observation: &Observation) -> f32 {
        let weights = &self.config.weights;
        let scale = self.config.sharpness_scale.max(f64::EPSILON);
        let sharpness = (observation.sharpness / scale).min(1.0) as f32;
        let frontalness = observation.detection.frontalness.unwrap_or(1.0);
        weights.confidence * observation.detection.confidence
            + weights.sharpness * sharpness
            + weights.frontalness * frontalness
    }

    fn prune(&mut self, now: f64) {
        let idle = self.config.idle_secs;
        let camera_id = self.camera_id;
        self.tracks.retain(|id, track| {
            let keep = now - track.last_seen <= idle;
            if !keep {
                log::debug!("tracker[{}]: pruned track {}", camera_id, id);
            }
            keep
        });
        let tracks = &self.tracks;
        self.last_counted
            .retain(|(id, _), at| tracks.contains_key(id) || now - *at < idle);
    }
}

fn temp_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x1: f32, x2: f32, confidence: f32) -> Observation {
        Observation::new(Detection::new(
            BBox::new(x1, 10.0, x2, 40.0),
            ObjectClass::Face,
            confidence,
        ))
    }

    fn embedded(mut observation: Observation, vector: Vec<f32>) -> Observation {
        observation.embedding = Some(Embedding {
            vector,
            score: 0.5,
            identity: None,
        });
        observation
    }

    #[test]
    fn zone_change_emits_single_event_and_improves_snapshot() {
        let mut tracker = Tracker::new(1, TrackerConfig::default());
        let mut first = face(20.0, 50.0, 0.8);
        first.sharpness = 100.0;
        let outcome = tracker.update(&[first], 80, 80, 100.0);
        assert!(outcome.events.is_empty());
        let tid = outcome.updates[0].track_id;
        let first_ref = tracker.track(tid).and_then(|t| t.best_snapshot.clone());
        let first_quality = tracker.track(tid).map(|t| t.best_quality).unwrap_or_default();

        let mut second = face(30.0, 60.0, 0.9);
        second.sharpness = 900.0;
        let outcome = tracker.update(&[second], 80, 80, 101.0);
        assert_eq!(outcome.events.len(), 1);
        let event = &outcome.events[0];
        assert_eq!(event.kind, EventKind::FaceIn);
        assert_eq!(event.track_id, tid);
        assert!(event.temp_id.is_some());

        let track = tracker.track(tid).cloned().unwrap();
        assert!(track.best_quality > first_quality);
        assert_ne!(track.best_snapshot, first_ref);
        assert_eq!(tracker.counts().entered, 1);
    }

    #[test]
    fn debounces_same_direction_within_cooldown() {
        let mut tracker = Tracker::new(1, TrackerConfig::default());
        let path = [(20.0, 50.0), (30.0, 60.0), (20.0, 50.0), (30.0, 60.0)];
        let mut events = Vec::new();
        for (i, (x1, x2)) in path.iter().enumerate() {
            let outcome = tracker.update(&[face(*x1, *x2, 0.9)], 80, 80, 10.0 + i as f64 * 0.5);
            events.extend(outcome.events);
        }
        let ins = events.iter().filter(|e| e.direction == Direction::In).count();
        assert_eq!(ins, 1);

        let outcome = tracker.update(&[face(20.0, 50.0, 0.9)], 80, 80, 13.0);
        assert_eq!(outcome.events.len(), 1);
        let outcome = tracker.update(&[face(30.0, 60.0, 0.9)], 80, 80, 13.5);
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].direction, Direction::In);
    }

    #[test]
    fn both_gates_must_pass() {
        let mut tracker = Tracker::new(1, TrackerConfig::default());
        let a = tracker.update(&[embedded(face(20.0, 50.0, 0.9), vec![1.0, 0.0])], 80, 80, 0.0);
        let b = tracker.update(&[embedded(face(21.0, 51.0, 0.9), vec![0.0, 1.0])], 80, 80, 0.1);
        assert_ne!(a.updates[0].track_id, b.updates[0].track_id);

        let c = tracker.update(&[embedded(face(22.0, 52.0, 0.9), vec![0.1, 1.0])], 80, 80, 0.2);
        assert_eq!(c.updates[0].track_id, b.updates[0].track_id);
    }

    #[test]
    fn running_mean_embedding() {
        let mut tracker = Tracker::new(1, TrackerConfig::default());
        let a = tracker.update(&[embedded(face(20.0, 50.0, 0.9), vec![1.0, 0.0])], 80, 80, 0.0);
        tracker.update(&[embedded(face(20.0, 50.0, 0.9), vec![1.0, 1.0])], 80, 80, 0.1);
        let avg = tracker
            .track(a.updates[0].track_id)
            .and_then(|t| t.embedding_avg.clone())
            .unwrap();
        assert_eq!(avg, vec![1.0, 0.5]);
    }

    #[test]
    fn reverse_and_horizontal_zones() {
        let line = LineConfig {
            orientation: Orientation::Horizontal,
            ratio: 0.5,
            reverse: true,
        };
        assert_eq!(zone_of(&BBox::new(0.0, 0.0, 10.0, 10.0), &line, 80, 80), Zone::Top);
        assert_eq!(
            zone_direction(Zone::Top, Zone::Bottom, &line),
            Some(Direction::Out)
        );
        assert_eq!(zone_direction(Zone::Top, Zone::Top, &line), None);
    }

    #[test]
    fn small_detections_ignored_and_idle_tracks_pruned() {
        let config = TrackerConfig {
            min_size: 10.0,
            ..TrackerConfig::default()
        };
        let mut tracker = Tracker::new(1, config);
        let tiny = Observation::new(Detection::new(
            BBox::new(0.0, 0.0, 5.0, 5.0),
            ObjectClass::Face,
            0.9,
        ));
        assert!(tracker.update(&[tiny], 80, 80, 0.0).updates.is_empty());

        tracker.update(&[face(20.0, 50.0, 0.9)], 80, 80, 0.0);
        assert_eq!(tracker.tracks().count(), 1);
        tracker.update(&[], 80, 80, 10.5);
        assert_eq!(tracker.tracks().count(), 0);
    }

    #[test]
    fn classes_outside_zone_set_do_not_emit() {
        let mut tracker = Tracker::new(1, TrackerConfig::default());
        let person = |x1: f32| {
            Observation::new(Detection::new(
                BBox::new(x1, 10.0, x1 + 30.0, 40.0),
                ObjectClass::Person,
                0.9,
            ))
        };
        tracker.update(&[person(20.0)], 80, 80, 0.0);
        let outcome = tracker.update(&[person(30.0)], 80, 80, 0.1);
        assert_eq!(outcome.updates.len(), 1);
        assert!(outcome.events.is_empty());
    }
}
