//! Append-only attendance log.

use crate::db::{millis_column, to_millis, Database};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub name: String,
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub participant_id: i64,
}

/// Filter for [`AttendanceLog::query_attendance`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AttendanceQuery {
    pub event: Option<String>,
    /// Half-open `[start, end)` time window.
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

pub trait AttendanceLog {
    fn append_attendance(
        &self,
        name: &str,
        event: &str,
        timestamp: DateTime<Utc>,
        participant_id: i64,
    ) -> Result<AttendanceRecord, StoreError>;
    /// Earliest record for `name` at `event` at or after `since`.
    fn attendance_since(&self, name: &str, event: &str, since: DateTime<Utc>) -> Result<Option<AttendanceRecord>, StoreError>;
    /// Matching records, newest first.
    fn query_attendance(&self, query: &AttendanceQuery) -> Result<Vec<AttendanceRecord>, StoreError>;
    /// `name`'s records, newest first.
    fn attendance_for(&self, name: &str) -> Result<Vec<AttendanceRecord>, StoreError>;
    fn attendance_record(&self, id: &str) -> Result<Option<AttendanceRecord>, StoreError>;
    fn delete_attendance(&self, id: &str) -> Result<bool, StoreError>;
}

const RECORD_COLUMNS: &str = "id, name, event, timestamp, participant_id";

fn record_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        event: row.get(2)?,
        timestamp: millis_column(row, 3)?,
        participant_id: row.get(4)?,
    })
}

impl AttendanceLog for Database {
    fn append_attendance(
        &self,
        name: &str,
        event: &str,
        timestamp: DateTime<Utc>,
        participant_id: i64,
    ) -> Result<AttendanceRecord, StoreError> {
        let record = AttendanceRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            event: event.to_string(),
            timestamp,
            participant_id,
        };
        self.conn.execute(
            "INSERT INTO attendance (id, name, event, timestamp, participant_id) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![record.id, record.name, record.event, to_millis(timestamp), participant_id],
        )?;
        tracing::info!(name, event, id = %record.id, "attendance recorded");
        Ok(record)
    }

    fn attendance_since(&self, name: &str, event: &str, since: DateTime<Utc>) -> Result<Option<AttendanceRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM attendance
             WHERE name = ?1 AND event = ?2 AND timestamp >= ?3
             ORDER BY timestamp LIMIT 1"
        );
        let record = self
            .conn
            .query_row(&sql, params![name, event, to_millis(since)], record_row)
            .optional()?;
        Ok(record)
    }

    fn query_attendance(&self, query: &AttendanceQuery) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut clauses = Vec::new();
        let mut args: Vec<Value> = Vec::new();
        if let Some(event) = &query.event {
            args.push(Value::Text(event.clone()));
            clauses.push(format!("event = ?{}", args.len()));
        }
        if let Some((start, end)) = query.window {
            args.push(Value::Integer(to_millis(start)));
            clauses.push(format!("timestamp >= ?{}", args.len()));
            args.push(Value::Integer(to_millis(end)));
            clauses.push(format!("timestamp < ?{}", args.len()));
        }

        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!("SELECT {RECORD_COLUMNS} FROM attendance {filter} ORDER BY timestamp DESC, rowid DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(args), record_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn attendance_for(&self, name: &str) -> Result<Vec<AttendanceRecord>, StoreError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM attendance WHERE name = ?1 ORDER BY timestamp DESC, rowid DESC");
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![name], record_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn attendance_record(&self, id: &str) -> Result<Option<AttendanceRecord>, StoreError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM attendance WHERE id = ?1");
        let record = self.conn.query_row(&sql, params![id], record_row).optional()?;
        Ok(record)
    }

    fn delete_attendance(&self, id: &str) -> Result<bool, StoreError> {
        let n = self.conn.execute("DELETE FROM attendance WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }
}
