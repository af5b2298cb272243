use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{0} already exists")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Map a UNIQUE constraint failure to [`StoreError::Conflict`].
    pub(crate) fn conflict_on_unique(err: rusqlite::Error, what: impl Into<String>) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(what.into())
            }
            _ => StoreError::Sqlite(err),
        }
    }
}
