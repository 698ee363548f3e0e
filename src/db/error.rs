use thiserror::Error;

/// Storage errors the scan and search layers need to tell apart.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The store could not be reached or is busy. Retrying later may succeed.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid stored timestamp {0:?}")]
    Timestamp(String),

    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(postgres::Error),
}

impl RepoError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RepoError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match e.sqlite_error_code() {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure,
            ) => RepoError::Unavailable(e.to_string()),
            _ => RepoError::Sqlite(e),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<postgres::Error> for RepoError {
    fn from(e: postgres::Error) -> Self {
        use std::error::Error as _;

        let io_failure = e
            .source()
            .is_some_and(|s| s.downcast_ref::<std::io::Error>().is_some());
        if e.is_closed() || io_failure {
            RepoError::Unavailable(e.to_string())
        } else {
            RepoError::Postgres(e)
        }
    }
}

#[cfg(feature = "postgres")]
impl From<r2d2::Error> for RepoError {
    fn from(e: r2d2::Error) -> Self {
        RepoError::Unavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_is_retryable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(RepoError::from(busy).is_retryable());

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(!RepoError::from(constraint).is_retryable());

        let mismatch = RepoError::DimensionMismatch { expected: 512, actual: 128 };
        assert!(!mismatch.is_retryable());
        assert_eq!(
            mismatch.to_string(),
            "Embedding dimension mismatch: expected 512, got 128"
        );
    }
}
