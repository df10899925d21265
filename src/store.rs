//! SQLite-backed screen event store.
//!
//! The worker appends `SCREEN_ON` / `SCREEN_OFF` rows; the CLI reads them back
//! for the "recent" and "last N" windows. Timestamps are stored as
//! `yyyy-MM-dd HH:mm:ss` text, which sorts chronologically.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::Local;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::audit::format_timestamp;
use crate::sensor::ScreenState;

pub const DEFAULT_RECENT_WINDOW: Duration = Duration::from_secs(12 * 60 * 60);
pub const DEFAULT_LAST_LIMIT: usize = 30;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS screen_events (
    _id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    timestamp TEXT NOT NULL
)";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create event store directory: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    #[serde(rename = "SCREEN_ON")]
    ScreenOn,
    #[serde(rename = "SCREEN_OFF")]
    ScreenOff,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::ScreenOn => "SCREEN_ON",
            EventType::ScreenOff => "SCREEN_OFF",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ScreenState> for EventType {
    fn from(state: ScreenState) -> Self {
        match state {
            ScreenState::On => EventType::ScreenOn,
            ScreenState::Off => EventType::ScreenOff,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScreenEvent {
    pub id: i64,
    pub event_type: String,
    pub timestamp: String,
}

pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(CREATE_TABLE)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLE)?;
        Ok(Self { conn })
    }

    pub fn insert(&self, event_type: EventType, timestamp: &str) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO screen_events (event_type, timestamp) VALUES (?1, ?2)",
            params![event_type.as_str(), timestamp],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!(id, %event_type, timestamp, "screen event stored");
        Ok(id)
    }

    /// Events at or after `cutoff`, newest first.
    pub fn since(&self, cutoff: &str) -> Result<Vec<ScreenEvent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT _id, event_type, timestamp FROM screen_events
             WHERE timestamp >= ?1 ORDER BY timestamp DESC, _id DESC",
        )?;
        let rows = stmt.query_map(params![cutoff], row_to_event)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Events within `window` of now, newest first.
    pub fn recent(&self, window: Duration) -> Result<Vec<ScreenEvent>, StoreError> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let cutoff = Local::now()
            .checked_sub_signed(window)
            .map(|at| format_timestamp(&at))
            .unwrap_or_default();
        self.since(&cutoff)
    }

    /// The latest `limit` events, oldest first.
    pub fn last(&self, limit: usize) -> Result<Vec<ScreenEvent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT _id, event_type, timestamp FROM screen_events
             ORDER BY timestamp DESC, _id DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], row_to_event)?;
        let mut events = rows.collect::<Result<Vec<_>, _>>()?;
        events.reverse();
        Ok(events)
    }

    pub fn last_time_of(&self, event_type: EventType) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT timestamp FROM screen_events WHERE event_type = ?1
                 ORDER BY timestamp DESC, _id DESC LIMIT 1",
                params![event_type.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScreenEvent> {
    Ok(ScreenEvent {
        id: row.get(0)?,
        event_type: row.get(1)?,
        timestamp: row.get(2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> EventStore {
        let store = EventStore::open_in_memory().unwrap();
        store.insert(EventType::ScreenOn, "2025-01-01 08:00:00").unwrap();
        store.insert(EventType::ScreenOff, "2025-01-01 08:30:00").unwrap();
        store.insert(EventType::ScreenOn, "2025-01-01 12:00:00").unwrap();
        store.insert(EventType::ScreenOff, "2025-01-01 12:05:00").unwrap();
        store
    }

    #[test]
    fn since_returns_newest_first() {
        let store = seeded();
        let events = store.since("2025-01-01 08:30:00").unwrap();
        let stamps: Vec<_> = events.iter().map(|e| e.timestamp.as_str()).collect();
        assert_eq!(
            stamps,
            vec![
                "2025-01-01 12:05:00",
                "2025-01-01 12:00:00",
                "2025-01-01 08:30:00"
            ]
        );
    }

    #[test]
    fn last_returns_oldest_first_within_limit() {
        let store = seeded();
        let events = store.last(2).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].timestamp, "2025-01-01 12:00:00");
        assert_eq!(events[0].event_type, "SCREEN_ON");
        assert_eq!(events[1].timestamp, "2025-01-01 12:05:00");
        assert_eq!(events[1].event_type, "SCREEN_OFF");
    }

    #[test]
    fn last_time_of_each_type() {
        let store = seeded();
        assert_eq!(
            store.last_time_of(EventType::ScreenOn).unwrap().as_deref(),
            Some("2025-01-01 12:00:00")
        );
        assert_eq!(
            store.last_time_of(EventType::ScreenOff).unwrap().as_deref(),
            Some("2025-01-01 12:05:00")
        );
    }

    #[test]
    fn empty_store_has_no_last_time() {
        let store = EventStore::open_in_memory().unwrap();
        assert!(store.last_time_of(EventType::ScreenOn).unwrap().is_none());
        assert!(store.last(DEFAULT_LAST_LIMIT).unwrap().is_empty());
    }

    #[test]
    fn recent_window_excludes_old_rows() {
        let store = seeded();
        let now = format_timestamp(&Local::now());
        store.insert(EventType::ScreenOn, &now).unwrap();

        let recent = store.recent(DEFAULT_RECENT_WINDOW).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].timestamp, now);
    }

    #[test]
    fn file_backed_store_persists_across_opens() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("db").join("screen_logger.db");
        {
            let store = EventStore::open(&path).unwrap();
            store.insert(EventType::ScreenOff, "2025-02-02 22:00:00").unwrap();
        }
        let store = EventStore::open(&path).unwrap();
        assert_eq!(store.last(10).unwrap().len(), 1);
    }

    #[test]
    fn screen_state_converts_to_event_type() {
        assert_eq!(EventType::from(ScreenState::On).to_string(), "SCREEN_ON");
        assert_eq!(EventType::from(ScreenState::Off).to_string(), "SCREEN_OFF");
    }
}
