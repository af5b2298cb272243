//! SQLite connection and schema.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS participants (
    id                    INTEGER PRIMARY KEY,
    name                  TEXT NOT NULL UNIQUE,
    email                 TEXT NOT NULL DEFAULT '',
    phone                 TEXT NOT NULL DEFAULT '',
    class                 TEXT NOT NULL DEFAULT '',
    program               TEXT NOT NULL DEFAULT '',
    program_code          TEXT NOT NULL DEFAULT '',
    course                TEXT NOT NULL DEFAULT '',
    course_code           TEXT NOT NULL DEFAULT '',
    faculty               TEXT NOT NULL DEFAULT '',
    faculty_id            TEXT NOT NULL DEFAULT '',
    period                TEXT NOT NULL DEFAULT '',
    attendance_percentage TEXT,
    image_id              TEXT,
    registered_at         INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS participant_attendance (
    participant_id INTEGER NOT NULL REFERENCES participants(id) ON DELETE CASCADE,
    event          TEXT NOT NULL,
    timestamp      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_participant_attendance ON participant_attendance(participant_id);

CREATE TABLE IF NOT EXISTS face_embeddings (
    name       TEXT NOT NULL,
    model      TEXT NOT NULL,
    dim        INTEGER NOT NULL,
    vector     BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (name, model)
);
CREATE INDEX IF NOT EXISTS idx_face_embeddings_model ON face_embeddings(model);

CREATE TABLE IF NOT EXISTS blobs (
    id           TEXT PRIMARY KEY,
    filename     TEXT NOT NULL,
    content_type TEXT NOT NULL,
    data         BLOB NOT NULL,
    created_at   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
    id             TEXT PRIMARY KEY,
    name           TEXT NOT NULL,
    event          TEXT NOT NULL,
    timestamp      INTEGER NOT NULL,
    participant_id INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attendance_lookup ON attendance(name, event, timestamp);

CREATE TABLE IF NOT EXISTS events (
    name       TEXT PRIMARY KEY,
    date       TEXT NOT NULL,
    time       TEXT NOT NULL,
    location   TEXT NOT NULL,
    faculty    TEXT NOT NULL DEFAULT '',
    faculty_id TEXT NOT NULL DEFAULT '',
    period     TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL
);
";

/// Row counts per collection, for health reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub participants: u64,
    pub embeddings: u64,
    pub events: u64,
    pub attendance: u64,
}

/// Handle to the roster database. Implements every store trait.
pub struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    /// Open (or create) the database file, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "opened roster database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Liveness check plus per-collection row counts.
    pub fn counts(&self) -> Result<Counts, StoreError> {
        let count = |sql: &str| -> Result<u64, StoreError> {
            let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };
        Ok(Counts {
            participants: count("SELECT COUNT(*) FROM participants")?,
            embeddings: count("SELECT COUNT(DISTINCT name) FROM face_embeddings")?,
            events: count("SELECT COUNT(*) FROM events")?,
            attendance: count("SELECT COUNT(*) FROM attendance")?,
        })
    }
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Adapter for use inside rusqlite row closures.
pub(crate) fn millis_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Integer,
            format!("timestamp out of range: {ms}").into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_is_empty() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.counts().unwrap(), Counts::default());
    }

    #[test]
    fn test_open_creates_parent_dirs_and_reopens() {
        let dir = std::env::temp_dir().join(format!("roster-db-test-{}", std::process::id()));
        let path = dir.join("nested").join("roster.db");
        {
            let db = Database::open(&path).unwrap();
            assert_eq!(db.counts().unwrap().participants, 0);
        }
        // Schema creation is idempotent.
        let db = Database::open(&path).unwrap();
        assert_eq!(db.counts().unwrap().events, 0);
        drop(db);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_millis_roundtrip() {
        let now = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_123).unwrap();
        let db = Database::open_in_memory().unwrap();
        let back = db
            .conn
            .query_row("SELECT ?1", [to_millis(now)], |row| millis_column(row, 0))
            .unwrap();
        assert_eq!(back, now);
    }
}
