//! Failure taxonomy shared by the catalog, the object store and both engines.

use std::io;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Bad or missing input. The caller's fault.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("stored object `{0}` not found")]
    NotFound(Uuid),

    /// The upload stream or a staging file could not be read or written.
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    /// The catalog or the object store is unavailable.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Transient lock conflict. Retried internally, never returned by the engines.
    #[error("transaction conflict: {0}")]
    Conflict(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Map an exhausted conflict onto the caller-visible storage failure.
    pub(crate) fn settle_conflict(self) -> Self {
        match self {
            Self::Conflict(msg) => Self::Storage(format!("gave up after repeated conflicts: {msg}")),
            other => other,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_busy(&err) {
            return StoreError::Conflict(err.to_string());
        }
        StoreError::Storage(err.to_string())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Return true if SQLite reported a lock it could not acquire in time.
pub(crate) fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let code_busy = db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff == 5 || code & 0xff == 6)
                .unwrap_or(false);
            let msg = db_err.message().to_ascii_lowercase();
            code_busy || msg.contains("database is locked") || msg.contains("database is busy")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_conflict_becomes_storage_failure() {
        let err = StoreError::Conflict("database is locked".into()).settle_conflict();
        assert!(matches!(err, StoreError::Storage(_)));

        let err = StoreError::validation("empty name").settle_conflict();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn pool_timeout_is_a_conflict() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_conflict());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_conflict());
    }
}
