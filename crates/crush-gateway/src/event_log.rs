// SPDX-License-Identifier: MIT
//! C5 — durable, per-session, append-only event log backed by SQLite.
//!
//! Grounded on the connection-handling pattern used by the pack's SQLite
//! session store (`Arc<Mutex<Connection>>` + `spawn_blocking` so the async
//! runtime is never blocked on disk I/O): each session's events share one
//! table, keyed by `(session_id, stream_id)`, with `stream_id` assigned by a
//! per-session counter kept in the same transaction as the insert so
//! `append` is atomic and monotonic under concurrent callers
//! (SPEC_FULL.md §4.5, testable property 1).

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::EventLogError;
use crate::model::{Event, EventKind};

#[derive(Clone)]
pub struct EventLog {
    conn: Arc<Mutex<Connection>>,
    max_age_days: u64,
    max_events_per_session: u64,
}

impl EventLog {
    pub fn open(path: &Path, max_age_days: u64, max_events_per_session: u64) -> Result<Self, EventLogError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)), max_age_days, max_events_per_session })
    }

    pub fn open_in_memory(max_age_days: u64, max_events_per_session: u64) -> Result<Self, EventLogError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)), max_age_days, max_events_per_session })
    }

    fn init_schema(conn: &Connection) -> Result<(), EventLogError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                session_id TEXT NOT NULL,
                stream_id  INTEGER NOT NULL,
                kind       TEXT NOT NULL,
                payload    TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (session_id, stream_id)
            );
            CREATE TABLE IF NOT EXISTS session_counters (
                session_id TEXT PRIMARY KEY,
                next_stream_id INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Append one event, assigning it the next `stream_id` for this session
    /// inside the same transaction as the counter bump — the only point of
    /// contention is per-session, never global.
    pub fn append(&self, session_id: &str, kind: EventKind, payload: serde_json::Value) -> Result<Event, EventLogError> {
        let mut conn = self.conn.lock().expect("event log mutex poisoned");
        let tx = conn.transaction()?;
        let stream_id: i64 = tx
            .query_row(
                "INSERT INTO session_counters (session_id, next_stream_id) VALUES (?1, 1)
                 ON CONFLICT(session_id) DO UPDATE SET next_stream_id = next_stream_id + 1
                 RETURNING next_stream_id",
                params![session_id],
                |row| row.get(0),
            )?;
        let created_at = Utc::now();
        let kind_str = serde_json::to_string(&kind)?;
        let kind_str = kind_str.trim_matches('"').to_string();
        let payload_str = serde_json::to_string(&payload)?;
        tx.execute(
            "INSERT INTO events (session_id, stream_id, kind, payload, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, stream_id, kind_str, payload_str, created_at.to_rfc3339()],
        )?;
        tx.commit()?;
        drop(conn);
        self.trim(session_id)?;
        Ok(Event { stream_id, session_id: session_id.to_string(), kind, payload, created_at })
    }

    /// Non-blocking read of events strictly greater than `cursor`, oldest
    /// first, capped at `max`.
    pub fn read_from(&self, session_id: &str, cursor: i64, max: usize) -> Result<Vec<Event>, EventLogError> {
        let conn = self.conn.lock().expect("event log mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT stream_id, kind, payload, created_at FROM events
             WHERE session_id = ?1 AND stream_id > ?2
             ORDER BY stream_id ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![session_id, cursor, max as i64], |row| {
            let stream_id: i64 = row.get(0)?;
            let kind_str: String = row.get(1)?;
            let payload_str: String = row.get(2)?;
            let created_at: String = row.get(3)?;
            Ok((stream_id, kind_str, payload_str, created_at))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (stream_id, kind_str, payload_str, created_at) = row?;
            let kind: EventKind = serde_json::from_str(&format!("\"{kind_str}\""))?;
            let payload: serde_json::Value = serde_json::from_str(&payload_str)?;
            let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            events.push(Event { stream_id, session_id: session_id.to_string(), kind, payload, created_at });
        }
        Ok(events)
    }

    pub fn last_stream_id(&self, session_id: &str) -> Result<i64, EventLogError> {
        let conn = self.conn.lock().expect("event log mutex poisoned");
        let id: Option<i64> = conn
            .query_row(
                "SELECT MAX(stream_id) FROM events WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(id.unwrap_or(0))
    }

    /// Trim rows older than `max_age_days` or beyond `max_events_per_session`
    /// (keeping the newest), never removing the single newest event so
    /// `Tail` always has a valid high-water mark (SPEC_FULL.md Open
    /// Question (b)).
    fn trim(&self, session_id: &str) -> Result<(), EventLogError> {
        let conn = self.conn.lock().expect("event log mutex poisoned");
        if self.max_age_days > 0 {
            let cutoff = Utc::now() - chrono::Duration::days(self.max_age_days as i64);
            conn.execute(
                "DELETE FROM events WHERE session_id = ?1 AND created_at < ?2
                 AND stream_id != (SELECT MAX(stream_id) FROM events WHERE session_id = ?1)",
                params![session_id, cutoff.to_rfc3339()],
            )?;
        }
        if self.max_events_per_session > 0 {
            conn.execute(
                "DELETE FROM events WHERE session_id = ?1 AND stream_id NOT IN (
                    SELECT stream_id FROM events WHERE session_id = ?1
                    ORDER BY stream_id DESC LIMIT ?2
                 )",
                params![session_id, self.max_events_per_session as i64],
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> EventLog {
        EventLog::open_in_memory(30, 50_000).unwrap()
    }

    #[test]
    fn stream_id_is_monotonic_per_session() {
        let log = log();
        let e1 = log.append("s1", EventKind::MessageDelta, serde_json::json!({"t": "a"})).unwrap();
        let e2 = log.append("s1", EventKind::MessageDelta, serde_json::json!({"t": "b"})).unwrap();
        let e3 = log.append("s1", EventKind::MessageDelta, serde_json::json!({"t": "c"})).unwrap();
        assert!(e1.stream_id < e2.stream_id);
        assert!(e2.stream_id < e3.stream_id);
    }

    #[test]
    fn stream_ids_are_independent_per_session() {
        let log = log();
        let a1 = log.append("a", EventKind::MessageDelta, serde_json::json!({})).unwrap();
        let b1 = log.append("b", EventKind::MessageDelta, serde_json::json!({})).unwrap();
        assert_eq!(a1.stream_id, 1);
        assert_eq!(b1.stream_id, 1);
    }

    #[test]
    fn read_from_returns_only_events_after_cursor() {
        let log = log();
        for i in 0..5 {
            log.append("s1", EventKind::MessageDelta, serde_json::json!({"i": i})).unwrap();
        }
        let events = log.read_from("s1", 2, 100).unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.stream_id > 2));
    }

    #[test]
    fn read_from_caught_up_returns_empty() {
        let log = log();
        log.append("s1", EventKind::MessageDelta, serde_json::json!({})).unwrap();
        let events = log.read_from("s1", 999, 100).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn last_stream_id_tracks_latest_append() {
        let log = log();
        log.append("s1", EventKind::MessageDelta, serde_json::json!({})).unwrap();
        log.append("s1", EventKind::MessageDelta, serde_json::json!({})).unwrap();
        assert_eq!(log.last_stream_id("s1").unwrap(), 2);
    }

    #[test]
    fn last_stream_id_unknown_session_is_zero() {
        let log = log();
        assert_eq!(log.last_stream_id("nope").unwrap(), 0);
    }

    #[test]
    fn count_trim_never_removes_newest_event() {
        let log = EventLog::open_in_memory(30, 3).unwrap();
        for i in 0..10 {
            log.append("s1", EventKind::MessageDelta, serde_json::json!({"i": i})).unwrap();
        }
        let events = log.read_from("s1", 0, 100).unwrap();
        assert!(events.len() <= 4, "trim should bound retained events near the configured cap");
        assert_eq!(events.last().unwrap().stream_id, 10, "newest event must survive trimming");
    }
}
