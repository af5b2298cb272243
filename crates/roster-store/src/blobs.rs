//! Opaque binary objects (registration photos) addressed by generated id.

use crate::db::{millis_column, to_millis, Database};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub id: String,
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

pub trait BlobStore {
    /// Store `data` and return its new id.
    fn put_blob(&self, filename: &str, content_type: &str, data: &[u8]) -> Result<String, StoreError>;
    fn blob(&self, id: &str) -> Result<Option<Blob>, StoreError>;
    fn delete_blob(&self, id: &str) -> Result<bool, StoreError>;
}

impl BlobStore for Database {
    fn put_blob(&self, filename: &str, content_type: &str, data: &[u8]) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO blobs (id, filename, content_type, data, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, filename, content_type, data, to_millis(Utc::now())],
        )?;
        tracing::debug!(id = %id, filename, bytes = data.len(), "blob stored");
        Ok(id)
    }

    fn blob(&self, id: &str) -> Result<Option<Blob>, StoreError> {
        let blob = self
            .conn
            .query_row(
                "SELECT id, filename, content_type, data, created_at FROM blobs WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Blob {
                        id: row.get(0)?,
                        filename: row.get(1)?,
                        content_type: row.get(2)?,
                        data: row.get(3)?,
                        created_at: millis_column(row, 4)?,
                    })
                },
            )
            .optional()?;
        Ok(blob)
    }

    fn delete_blob(&self, id: &str) -> Result<bool, StoreError> {
        let n = self.conn.execute("DELETE FROM blobs WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }
}
