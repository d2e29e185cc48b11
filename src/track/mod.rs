//! Track association, zone events and line-crossing counts.

mod counting;
mod events;
mod tracker;

pub use counting::{
    cross_events, side_of_line, CrossingConfig, Counts, Line, LineConfig, LineCounter,
    Orientation,
};
pub use events::{CrossingEvent, Direction, EventKind, EventSink, InMemoryEventSink, LogEventSink};
pub use tracker::{
    zone_direction, zone_of, FrameOutcome, Observation, QualityWeights, Track, TrackUpdate,
    Tracker, TrackerConfig, Zone, DEFAULT_COUNT_COOLDOWN_SECS, DEFAULT_IOU_THRESHOLD,
    DEFAULT_SHARPNESS_SCALE, DEFAULT_SIMILARITY_THRESHOLD, DEFAULT_TRACK_IDLE_SECS,
};
