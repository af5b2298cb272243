//! Registered participants and their embedded attendance history.

use crate::db::{millis_column, to_millis, Database};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Contact and enrolment metadata supplied at registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantDetails {
    pub email: String,
    pub phone: String,
    pub class: String,
    pub program: String,
    pub program_code: String,
    pub course: String,
    pub course_code: String,
    pub faculty: String,
    pub faculty_id: String,
    pub period: String,
    pub attendance_percentage: Option<String>,
}

/// One entry of a participant's attendance history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEntry {
    pub event: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Participant {
    pub id: i64,
    pub name: String,
    #[serde(flatten)]
    pub details: ParticipantDetails,
    /// Blob id of the registration photo, if one was stored.
    pub image_id: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub attendance: Vec<AttendanceEntry>,
}

/// A participant about to be inserted.
#[derive(Debug, Clone)]
pub struct NewParticipant {
    pub name: String,
    pub details: ParticipantDetails,
    pub image_id: Option<String>,
    pub registered_at: DateTime<Utc>,
}

pub trait IdentityStore {
    /// Insert a participant. Fails with [`StoreError::Conflict`] if the name is taken.
    fn insert_participant(&self, participant: &NewParticipant) -> Result<Participant, StoreError>;
    fn participant(&self, name: &str) -> Result<Option<Participant>, StoreError>;
    fn participant_exists(&self, name: &str) -> Result<bool, StoreError>;
    /// All participants, in registration order.
    fn participants(&self) -> Result<Vec<Participant>, StoreError>;
    /// Remove a participant and its attendance history. Returns the removed record.
    fn delete_participant(&self, name: &str) -> Result<Option<Participant>, StoreError>;
    fn push_attendance(&self, name: &str, entry: &AttendanceEntry) -> Result<(), StoreError>;
    /// Remove entries matching `entry` exactly. Returns how many were removed.
    fn pull_attendance(&self, name: &str, entry: &AttendanceEntry) -> Result<usize, StoreError>;
}

const PARTICIPANT_COLUMNS: &str = "id, name, email, phone, class, program, program_code, course, \
     course_code, faculty, faculty_id, period, attendance_percentage, image_id, registered_at";

fn participant_row(row: &Row<'_>) -> rusqlite::Result<Participant> {
    Ok(Participant {
        id: row.get(0)?,
        name: row.get(1)?,
        details: ParticipantDetails {
            email: row.get(2)?,
            phone: row.get(3)?,
            class: row.get(4)?,
            program: row.get(5)?,
            program_code: row.get(6)?,
            course: row.get(7)?,
            course_code: row.get(8)?,
            faculty: row.get(9)?,
            faculty_id: row.get(10)?,
            period: row.get(11)?,
            attendance_percentage: row.get(12)?,
        },
        image_id: row.get(13)?,
        registered_at: millis_column(row, 14)?,
        attendance: Vec::new(),
    })
}

impl Database {
    fn attendance_entries(&self, participant_id: i64) -> Result<Vec<AttendanceEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT event, timestamp FROM participant_attendance
             WHERE participant_id = ?1 ORDER BY rowid",
        )?;
        let entries = stmt
            .query_map(params![participant_id], |row| {
                Ok(AttendanceEntry {
                    event: row.get(0)?,
                    timestamp: millis_column(row, 1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn participant_id(&self, name: &str) -> Result<i64, StoreError> {
        self.conn
            .query_row("SELECT id FROM participants WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("participant {name}")))
    }
}

impl IdentityStore for Database {
    fn insert_participant(&self, p: &NewParticipant) -> Result<Participant, StoreError> {
        let d = &p.details;
        self.conn
            .execute(
                "INSERT INTO participants (name, email, phone, class, program, program_code, course,
                    course_code, faculty, faculty_id, period, attendance_percentage, image_id, registered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    p.name,
                    d.email,
                    d.phone,
                    d.class,
                    d.program,
                    d.program_code,
                    d.course,
                    d.course_code,
                    d.faculty,
                    d.faculty_id,
                    d.period,
                    d.attendance_percentage,
                    p.image_id,
                    to_millis(p.registered_at),
                ],
            )
            .map_err(|e| StoreError::conflict_on_unique(e, format!("participant {}", p.name)))?;

        tracing::info!(name = %p.name, "participant stored");
        self.participant(&p.name)?
            .ok_or_else(|| StoreError::NotFound(format!("participant {}", p.name)))
    }

    fn participant(&self, name: &str) -> Result<Option<Participant>, StoreError> {
        let sql = format!("SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE name = ?1");
        let found = self
            .conn
            .query_row(&sql, params![name], participant_row)
            .optional()?;
        match found {
            Some(mut p) => {
                p.attendance = self.attendance_entries(p.id)?;
                Ok(Some(p))
            }
            None => Ok(None),
        }
    }

    fn participant_exists(&self, name: &str) -> Result<bool, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM participants WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    fn participants(&self) -> Result<Vec<Participant>, StoreError> {
        let sql = format!("SELECT {PARTICIPANT_COLUMNS} FROM participants ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut all = stmt
            .query_map([], participant_row)?
            .collect::<Result<Vec<_>, _>>()?;
        for p in &mut all {
            p.attendance = self.attendance_entries(p.id)?;
        }
        Ok(all)
    }

    fn delete_participant(&self, name: &str) -> Result<Option<Participant>, StoreError> {
        let Some(existing) = self.participant(name)? else {
            return Ok(None);
        };
        self.conn
            .execute("DELETE FROM participants WHERE id = ?1", params![existing.id])?;
        tracing::info!(name, "participant deleted");
        Ok(Some(existing))
    }

    fn push_attendance(&self, name: &str, entry: &AttendanceEntry) -> Result<(), StoreError> {
        let id = self.participant_id(name)?;
        self.conn.execute(
            "INSERT INTO participant_attendance (participant_id, event, timestamp) VALUES (?1, ?2, ?3)",
            params![id, entry.event, to_millis(entry.timestamp)],
        )?;
        Ok(())
    }

    fn pull_attendance(&self, name: &str, entry: &AttendanceEntry) -> Result<usize, StoreError> {
        let id = match self.participant_id(name) {
            Ok(id) => id,
            Err(StoreError::NotFound(_)) => return Ok(0),
            Err(e) => return Err(e),
        };
        let n = self.conn.execute(
            "DELETE FROM participant_attendance WHERE participant_id = ?1 AND event = ?2 AND timestamp = ?3",
            params![id, entry.event, to_millis(entry.timestamp)],
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn new_participant(name: &str) -> NewParticipant {
        NewParticipant {
            name: name.to_string(),
            details: ParticipantDetails {
                email: format!("{name}@example.edu"),
                course: "CS101".into(),
                attendance_percentage: Some("92".into()),
                ..Default::default()
            },
            image_id: Some("blob-1".into()),
            registered_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
        }
    }

    fn entry(event: &str, hour: u32) -> AttendanceEntry {
        AttendanceEntry {
            event: event.to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_insert_and_fetch() {
        let db = Database::open_in_memory().unwrap();
        let stored = db.insert_participant(&new_participant("alice")).unwrap();
        assert_eq!(stored.name, "alice");
        assert_eq!(stored.details.email, "alice@example.edu");
        assert_eq!(stored.details.attendance_percentage.as_deref(), Some("92"));
        assert_eq!(stored.image_id.as_deref(), Some("blob-1"));
        assert!(stored.attendance.is_empty());

        assert_eq!(db.participant("alice").unwrap(), Some(stored));
        assert!(db.participant_exists("alice").unwrap());
        assert!(!db.participant_exists("bob").unwrap());
        assert!(db.participant("bob").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_name_conflicts() {
        let db = Database::open_in_memory().unwrap();
        db.insert_participant(&new_participant("alice")).unwrap();
        let err = db.insert_participant(&new_participant("alice")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "got {err:?}");
        assert_eq!(db.participants().unwrap().len(), 1);
    }

    #[test]
    fn test_push_and_pull_attendance() {
        let db = Database::open_in_memory().unwrap();
        db.insert_participant(&new_participant("alice")).unwrap();
        db.push_attendance("alice", &entry("Lecture", 9)).unwrap();
        db.push_attendance("alice", &entry("Lab", 14)).unwrap();

        let p = db.participant("alice").unwrap().unwrap();
        assert_eq!(p.attendance, vec![entry("Lecture", 9), entry("Lab", 14)]);

        assert_eq!(db.pull_attendance("alice", &entry("Lecture", 10)).unwrap(), 0, "timestamp must match");
        assert_eq!(db.pull_attendance("alice", &entry("Lecture", 9)).unwrap(), 1);
        assert_eq!(db.participant("alice").unwrap().unwrap().attendance, vec![entry("Lab", 14)]);
        assert_eq!(db.pull_attendance("nobody", &entry("Lab", 14)).unwrap(), 0);
    }

    #[test]
    fn test_push_attendance_unknown_participant() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(db.push_attendance("ghost", &entry("Lab", 9)), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_delete_cascades_history() {
        let db = Database::open_in_memory().unwrap();
        db.insert_participant(&new_participant("alice")).unwrap();
        db.insert_participant(&new_participant("bob")).unwrap();
        db.push_attendance("alice", &entry("Lab", 9)).unwrap();

        let removed = db.delete_participant("alice").unwrap().unwrap();
        assert_eq!(removed.attendance.len(), 1);
        assert!(db.participant("alice").unwrap().is_none());
        assert!(db.delete_participant("alice").unwrap().is_none());

        let left: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM participant_attendance", [], |r| r.get(0))
            .unwrap();
        assert_eq!(left, 0);
        assert_eq!(db.participants().unwrap().len(), 1);
    }
}
