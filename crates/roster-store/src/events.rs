//! Scheduled events that attendance is marked against.

use crate::db::{millis_column, to_millis, Database};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub name: String,
    pub date: String,
    pub time: String,
    pub location: String,
    pub faculty: String,
    pub faculty_id: String,
    pub period: String,
    pub created_at: DateTime<Utc>,
}

pub trait EventStore {
    /// Insert an event. Fails with [`StoreError::Conflict`] if the name is taken.
    fn insert_event(&self, event: &Event) -> Result<(), StoreError>;
    /// All events, in creation order.
    fn events(&self) -> Result<Vec<Event>, StoreError>;
    fn delete_event(&self, name: &str) -> Result<bool, StoreError>;
}

impl EventStore for Database {
    fn insert_event(&self, event: &Event) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO events (name, date, time, location, faculty, faculty_id, period, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event.name,
                    event.date,
                    event.time,
                    event.location,
                    event.faculty,
                    event.faculty_id,
                    event.period,
                    to_millis(event.created_at),
                ],
            )
            .map_err(|e| StoreError::conflict_on_unique(e, format!("event {}", event.name)))?;
        tracing::info!(name = %event.name, "event created");
        Ok(())
    }

    fn events(&self) -> Result<Vec<Event>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT name, date, time, location, faculty, faculty_id, period, created_at
             FROM events ORDER BY rowid",
        )?;
        let events = stmt
            .query_map([], |row| {
                Ok(Event {
                    name: row.get(0)?,
                    date: row.get(1)?,
                    time: row.get(2)?,
                    location: row.get(3)?,
                    faculty: row.get(4)?,
                    faculty_id: row.get(5)?,
                    period: row.get(6)?,
                    created_at: millis_column(row, 7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    fn delete_event(&self, name: &str) -> Result<bool, StoreError> {
        let n = self.conn.execute("DELETE FROM events WHERE name = ?1", params![name])?;
        Ok(n > 0)
    }
}
