//! Crossing events and the sink contract they are delivered through.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

use crate::detect::ObjectClass;
use crate::CameraId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Direction::In => Direction::Out,
            Direction::Out => Direction::In,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every event name emitted by the tracking stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PersonEntry,
    PersonExit,
    VehicleEntry,
    VehicleExit,
    FaceIn,
    FaceOut,
}

impl EventKind {
    /// Event kind for a crossing of `class` in `direction`, if that class is counted.
    pub fn for_crossing(class: ObjectClass, direction: Direction) -> Option<Self> {
        let kind = match (class, direction) {
            (ObjectClass::Person, Direction::In) => EventKind::PersonEntry,
            (ObjectClass::Person, Direction::Out) => EventKind::PersonExit,
            (ObjectClass::Vehicle, Direction::In) => EventKind::VehicleEntry,
            (ObjectClass::Vehicle, Direction::Out) => EventKind::VehicleExit,
            (ObjectClass::Face, Direction::In) => EventKind::FaceIn,
            (ObjectClass::Face, Direction::Out) => EventKind::FaceOut,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::PersonEntry => "person_entry",
            EventKind::PersonExit => "person_exit",
            EventKind::VehicleEntry => "vehicle_entry",
            EventKind::VehicleExit => "vehicle_exit",
            EventKind::FaceIn => "face_in",
            EventKind::FaceOut => "face_out",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrossingEvent {
    /// Unix seconds.
    pub timestamp: u64,
    pub camera_id: CameraId,
    pub track_id: u64,
    pub kind: EventKind,
    pub direction: Direction,
    pub class: ObjectClass,
    /// Best-known identity; unknown tracks carry a temporary id instead.
    pub identity: Option<String>,
    pub temp_id: Option<String>,
    pub score: f32,
    pub snapshot_ref: Option<String>,
}

/// Receiver for crossing events. Callers log and drop sink errors.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &CrossingEvent) -> Result<()>;
}

/// Writes events to the log only.
#[derive(Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn publish(&self, event: &CrossingEvent) -> Result<()> {
        log::info!(
            "event: {} camera={} track={} dir={} class={} snapshot={}",
            event.kind,
            event.camera_id,
            event.track_id,
            event.direction,
            event.class,
            event.snapshot_ref.as_deref().unwrap_or("-")
        );
        Ok(())
    }
}

/// Collects events in memory (tests, diagnostics).
#[derive(Default)]
pub struct InMemoryEventSink {
    events: Mutex<Vec<CrossingEvent>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CrossingEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for InMemoryEventSink {
    fn publish(&self, event: &CrossingEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow!("event sink lock poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crossing_kinds_cover_counted_classes() {
        assert_eq!(
            EventKind::for_crossing(ObjectClass::Vehicle, Direction::Out),
            Some(EventKind::VehicleExit)
        );
        assert_eq!(
            EventKind::for_crossing(ObjectClass::Face, Direction::In),
            Some(EventKind::FaceIn)
        );
        assert_eq!(EventKind::for_crossing(ObjectClass::Animal, Direction::In), None);
    }

    #[test]
    fn event_serializes_with_snake_case_kind() -> Result<()> {
        let event = CrossingEvent {
            timestamp: 1_700_000_000,
            camera_id: 3,
            track_id: 7,
            kind: EventKind::PersonEntry,
            direction: Direction::In,
            class: ObjectClass::Person,
            identity: None,
            temp_id: Some("abc".to_string()),
            score: 0.0,
            snapshot_ref: None,
        };
        let json = serde_json::to_value(&event)?;
        assert_eq!(json["kind"], "person_entry");
        assert_eq!(json["direction"], "in");
        Ok(())
    }
}
