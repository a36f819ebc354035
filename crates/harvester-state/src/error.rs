//! State backend error types.

use harvester_types::state::{ConnectionName, JobId};

/// Errors produced by [`StateBackend`](crate::StateBackend) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Underlying `PostgreSQL` failure.
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state backend lock poisoned")]
    LockPoisoned,

    /// A stored row could not be decoded.
    #[error("corrupt state row: {0}")]
    Corrupt(String),

    /// A job still references the connection.
    #[error("connection '{connection}' is used by job '{job}'")]
    ConnectionInUse {
        connection: ConnectionName,
        job: String,
    },

    /// No job with the given id exists.
    #[error("job '{0}' not found")]
    JobNotFound(JobId),

    /// A live job already uses the name.
    #[error("a job named '{0}' already exists")]
    DuplicateJobName(String),
}

impl StateError {
    /// Whether the failed transaction was aborted by contention and may be
    /// retried as a whole.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            #[cfg(feature = "postgres")]
            Self::Postgres(err) => err.code().is_some_and(|code| {
                *code == postgres::error::SqlState::T_R_SERIALIZATION_FAILURE
                    || *code == postgres::error::SqlState::T_R_DEADLOCK_DETECTED
            }),
            _ => false,
        }
    }

    #[must_use]
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> StateError {
        StateError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(code),
            Some("boom".into()),
        ))
    }

    #[test]
    fn busy_and_locked_are_retryable() {
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_BUSY).is_retryable());
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_LOCKED).is_retryable());
        assert!(!sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT).is_retryable());
        assert!(!StateError::LockPoisoned.is_retryable());
    }

    #[test]
    fn sqlite_error_displays_context() {
        let msg = sqlite_failure(1).to_string();
        assert!(msg.contains("sqlite"), "got: {msg}");
    }

    #[test]
    fn lock_poisoned_displays() {
        assert_eq!(
            StateError::LockPoisoned.to_string(),
            "state backend lock poisoned"
        );
    }

    #[test]
    fn connection_in_use_names_both_sides() {
        let err = StateError::ConnectionInUse {
            connection: ConnectionName::new("files"),
            job: "crawl".into(),
        };
        assert_eq!(err.to_string(), "connection 'files' is used by job 'crawl'");
    }
}
