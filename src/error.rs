// ABOUTME: Error taxonomy for watermark-driven sync runs
// ABOUTME: Classifies backend failures as retryable, constraint or fatal

use std::fmt;

/// Result alias used throughout the sync core.
pub type SyncResult<T> = Result<T, SyncError>;

/// Failures surfaced by the sync core and its storage backends.
///
/// Only [`SyncError::Transient`] is retryable. A missing watermark and an
/// empty change set are not errors and never produce a value of this type.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Connectivity or availability problem. Safe to retry the whole run.
    #[error("transient failure during {operation}: {message}")]
    Transient {
        operation: &'static str,
        message: String,
    },

    /// A row violated a destination constraint. The batch was not committed.
    #[error("constraint violation{}: {message}", fmt_row(.id))]
    ConstraintViolation { id: Option<i64>, message: String },

    /// A non-transactional destination wrote some rows before failing.
    /// The destination needs manual reconciliation before the next run.
    #[error("partial write: {applied} of {total} rows applied before failure: {message}")]
    PartialWrite {
        applied: usize,
        total: usize,
        message: String,
    },

    /// Non-transient backend failure (missing table, malformed SQL, ...).
    #[error("storage failure during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    /// A stored value could not be decoded into a record or marker.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The sync job is misconfigured.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether re-running the same invocation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient { .. })
    }

    pub fn transient(operation: &'static str, message: impl fmt::Display) -> Self {
        SyncError::Transient {
            operation,
            message: message.to_string(),
        }
    }

    pub fn storage(operation: &'static str, message: impl fmt::Display) -> Self {
        SyncError::Storage {
            operation,
            message: message.to_string(),
        }
    }

    pub fn constraint(id: Option<i64>, message: impl fmt::Display) -> Self {
        SyncError::ConstraintViolation {
            id,
            message: message.to_string(),
        }
    }

    /// Classify a PostgreSQL client error.
    ///
    /// SQLSTATE class 23 (integrity constraint violation) maps to
    /// [`SyncError::ConstraintViolation`]. A closed connection, a socket I/O
    /// failure and connection-class SQLSTATEs are transient. Everything else,
    /// including parameter and column conversion failures, is a storage
    /// failure.
    pub fn from_postgres(operation: &'static str, err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            return SyncError::transient(operation, err);
        }

        match err.as_db_error() {
            Some(db) => {
                let code = db.code().code();
                if code.starts_with("23") {
                    SyncError::constraint(None, db.message())
                } else if code.starts_with("08")
                    || code.starts_with("53")
                    || code.starts_with("57P")
                    || code == "40001"
                    || code == "40P01"
                {
                    SyncError::transient(operation, db.message())
                } else {
                    SyncError::storage(operation, db.message())
                }
            }
            None if caused_by_io(&err) => SyncError::transient(operation, err),
            None => SyncError::storage(operation, err),
        }
    }

    /// Classify a SQLite error by its primary result code.
    pub fn from_sqlite(operation: &'static str, err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(failure, message) => {
                let message = message
                    .clone()
                    .unwrap_or_else(|| failure.to_string());
                match failure.code {
                    ErrorCode::ConstraintViolation => SyncError::constraint(None, message),
                    ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure => SyncError::transient(operation, message),
                    _ => SyncError::storage(operation, message),
                }
            }
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..) => SyncError::InvalidData(err.to_string()),
            _ => SyncError::storage(operation, err),
        }
    }

    /// Attach the offending row id to a constraint violation.
    pub(crate) fn with_row_id(self, row_id: i64) -> Self {
        match self {
            SyncError::ConstraintViolation { id: None, message } => {
                SyncError::ConstraintViolation {
                    id: Some(row_id),
                    message,
                }
            }
            other => other,
        }
    }
}

/// Whether an `std::io::Error` appears anywhere in the source chain.
fn caused_by_io(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cause = err.source();
    while let Some(e) = cause {
        if e.is::<std::io::Error>() {
            return true;
        }
        cause = e.source();
    }
    false
}

fn fmt_row(id: &Option<i64>) -> String {
    match id {
        Some(id) => format!(" on row {}", id),
        None => String::new(),
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::transient("file I/O", err)
    }
}
