use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::manager::BreakerState;
use crate::track::{CrossingEvent, EventKind};
use crate::CameraId;

pub use crate::track::{EventSink, InMemoryEventSink, LogEventSink};

/// Health snapshot published after every breaker transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraStatus {
    pub camera_id: CameraId,
    pub breaker: BreakerState,
    pub fail_count: u32,
    /// Milliseconds until the next start attempt is allowed.
    pub next_retry_in_ms: Option<u64>,
    pub online: bool,
    pub last_error: Option<String>,
    /// Unix seconds.
    pub updated_at: u64,
}

/// External store for camera health. Callers log and drop failures.
pub trait StatusStore: Send + Sync {
    fn publish(&self, status: &CameraStatus) -> Result<()>;

    fn get(&self, camera_id: CameraId) -> Result<Option<CameraStatus>>;
}

/// Statuses kept by `InMemoryStatusStore::history`.
pub const DEFAULT_STATUS_HISTORY: usize = 256;

pub struct InMemoryStatusStore {
    statuses: Mutex<HashMap<CameraId, CameraStatus>>,
    history: Mutex<VecDeque<CameraStatus>>,
    history_limit: usize,
}

impl Default for InMemoryStatusStore {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_STATUS_HISTORY)
    }
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            statuses: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(limit.min(DEFAULT_STATUS_HISTORY))),
            history_limit: limit.max(1),
        }
    }

    /// The most recent published statuses, oldest first.
    pub fn history(&self) -> Vec<CameraStatus> {
        self.history
            .lock()
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl StatusStore for InMemoryStatusStore {
    fn publish(&self, status: &CameraStatus) -> Result<()> {
        self.statuses
            .lock()
            .map_err(|_| anyhow!("status store lock poisoned"))?
            .insert(status.camera_id, status.clone());
        let mut history = self
            .history
            .lock()
            .map_err(|_| anyhow!("status store lock poisoned"))?;
        while history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(status.clone());
        Ok(())
    }

    fn get(&self, camera_id: CameraId) -> Result<Option<CameraStatus>> {
        Ok(self
            .statuses
            .lock()
            .map_err(|_| anyhow!("status store lock poisoned"))?
            .get(&camera_id)
            .cloned())
    }
}

/// Logs each status; keeps nothing.
#[derive(Default)]
pub struct LogStatusStore;

impl StatusStore for LogStatusStore {
    fn publish(&self, status: &CameraStatus) -> Result<()> {
        log::info!(
            "status: camera={} breaker={} fails={} online={} next_retry_ms={:?}",
            status.camera_id,
            status.breaker,
            status.fail_count,
            status.online,
            status.next_retry_in_ms
        );
        Ok(())
    }

    fn get(&self, _camera_id: CameraId) -> Result<Option<CameraStatus>> {
        Ok(None)
    }
}

pub struct SqliteStatusStore {
    conn: Mutex<Connection>,
}

impl SqliteStatusStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.lock()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS camera_status (
              camera_id INTEGER PRIMARY KEY,
              updated_at INTEGER NOT NULL,
              breaker TEXT NOT NULL,
              fail_count INTEGER NOT NULL,
              online INTEGER NOT NULL,
              payload_json TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("status db lock poisoned"))
    }
}

impl StatusStore for SqliteStatusStore {
    fn publish(&self, status: &CameraStatus) -> Result<()> {
        let payload_json = serde_json::to_string(status)?;
        self.lock()?.execute(
            r#"
            INSERT INTO camera_status(camera_id, updated_at, breaker, fail_count, online, payload_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(camera_id) DO UPDATE SET
              updated_at = excluded.updated_at,
              breaker = excluded.breaker,
              fail_count = excluded.fail_count,
              online = excluded.online,
              payload_json = excluded.payload_json
            "#,
            params![
                status.camera_id as i64,
                status.updated_at as i64,
                status.breaker.as_str(),
                status.fail_count as i64,
                status.online,
                payload_json
            ],
        )?;
        Ok(())
    }

    fn get(&self, camera_id: CameraId) -> Result<Option<CameraStatus>> {
        let conn = self.lock()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM camera_status WHERE camera_id = ?1",
                params![camera_id as i64],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|payload| serde_json::from_str(&payload).map_err(Into::into))
            .transpose()
    }
}

/// Appends crossing events to an `events` table.
pub struct SqliteEventSink {
    conn: Mutex<Connection>,
}

impl SqliteEventSink {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let sink = Self {
            conn: Mutex::new(conn),
        };
        sink.ensure_schema()?;
        Ok(sink)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.lock()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at INTEGER NOT NULL,
              camera_id INTEGER NOT NULL,
              track_id INTEGER NOT NULL,
              kind TEXT NOT NULL,
              payload_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_camera ON events(camera_id, created_at);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("events db lock poisoned"))
    }

    /// Most recent events for a camera, newest first.
    pub fn recent(&self, camera_id: CameraId, limit: usize) -> Result<Vec<CrossingEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM events WHERE camera_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![camera_id as i64, limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let payload: String = row.get(0)?;
            out.push(serde_json::from_str(&payload)?);
        }
        Ok(out)
    }

    pub fn count(&self, camera_id: CameraId, kind: EventKind) -> Result<u64> {
        let n: i64 = self.lock()?.query_row(
            "SELECT COUNT(*) FROM events WHERE camera_id = ?1 AND kind = ?2",
            params![camera_id as i64, kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u64)
    }
}

impl EventSink for SqliteEventSink {
    fn publish(&self, event: &CrossingEvent) -> Result<()> {
        let created_at = i64::try_from(event.timestamp)
            .map_err(|_| anyhow!("event timestamp exceeds i64 range"))?;
        let payload_json = serde_json::to_string(event)?;
        self.lock()?.execute(
            r#"
            INSERT INTO events(created_at, camera_id, track_id, kind, payload_json)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                created_at,
                event.camera_id as i64,
                event.track_id as i64,
                event.kind.as_str(),
                payload_json
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ObjectClass;
    use crate::track::Direction;

    fn status(camera_id: CameraId, breaker: BreakerState, fail_count: u32) -> CameraStatus {
        CameraStatus {
            camera_id,
            breaker,
            fail_count,
            next_retry_in_ms: Some(500),
            online: false,
            last_error: Some("STREAM_UNAVAILABLE (CONNECT_TIMEOUT)".to_string()),
            updated_at: 1_700_000_000,
        }
    }

    #[test]
    fn sqlite_status_upserts_per_camera() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("status.db");
        let store = SqliteStatusStore::open(path.to_str().unwrap_or_default())?;

        store.publish(&status(4, BreakerState::Closed, 1))?;
        store.publish(&status(4, BreakerState::Open, 3))?;
        let latest = store.get(4)?.ok_or_else(|| anyhow!("missing status"))?;
        assert_eq!(latest.breaker, BreakerState::Open);
        assert_eq!(latest.fail_count, 3);
        assert!(store.get(5)?.is_none());
        Ok(())
    }

    #[test]
    fn sqlite_events_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.db");
        let sink = SqliteEventSink::open(path.to_str().unwrap_or_default())?;
        let event = CrossingEvent {
            timestamp: 1_700_000_000,
            camera_id: 2,
            track_id: 9,
            kind: EventKind::VehicleExit,
            direction: Direction::Out,
            class: ObjectClass::Vehicle,
            identity: None,
            temp_id: None,
            score: 0.0,
            snapshot_ref: None,
        };
        sink.publish(&event)?;
        sink.publish(&event)?;
        assert_eq!(sink.count(2, EventKind::VehicleExit)?, 2);
        assert_eq!(sink.count(2, EventKind::VehicleEntry)?, 0);
        assert_eq!(sink.recent(2, 1)?, vec![event]);
        Ok(())
    }

    #[test]
    fn in_memory_keeps_history() -> Result<()> {
        let store = InMemoryStatusStore::new();
        store.publish(&status(1, BreakerState::Closed, 1))?;
        store.publish(&status(1, BreakerState::HalfOpen, 3))?;
        assert_eq!(store.history().len(), 2);
        assert_eq!(store.get(1)?.map(|s| s.breaker), Some(BreakerState::HalfOpen));
        Ok(())
    }

    #[test]
    fn in_memory_history_is_bounded() -> Result<()> {
        let store = InMemoryStatusStore::with_history_limit(3);
        for fail_count in 1..=10 {
            store.publish(&status(1, BreakerState::Closed, fail_count))?;
        }
        let kept: Vec<u32> = store.history().iter().map(|s| s.fail_count).collect();
        assert_eq!(kept, vec![8, 9, 10]);
        assert_eq!(store.get(1)?.map(|s| s.fail_count), Some(10));
        Ok(())
    }
}
