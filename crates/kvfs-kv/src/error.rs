//! KV error types.

use thiserror::Error;

/// Errors surfaced by a transactional KV store.
#[derive(Debug, Error)]
pub enum KvError {
    /// Another transaction committed a write this one depended on.
    ///
    /// Retryable: `transact` restarts the closure when it sees this.
    #[error("transaction conflict")]
    Conflict,

    /// `transact` gave up after this many attempts.
    #[error("transaction retry limit exceeded after {0} attempts")]
    RetryLimitExceeded(u32),

    /// The backing store failed.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A stored value could not be decoded.
    #[error("corrupt value: {0}")]
    Corrupt(String),
}

impl KvError {
    /// Create a Backend error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a Corrupt error.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Returns true if the whole transaction should be re-run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::Conflict)
    }
}

impl From<rusqlite::Error> for KvError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                KvError::Conflict
            }
            _ => KvError::Backend(e.to_string()),
        }
    }
}

/// KV result type.
pub type KvResult<T> = Result<T, KvError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn sqlite_failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(code), None)
    }

    #[test]
    fn test_busy_and_locked_are_retryable() {
        for code in [ffi::SQLITE_BUSY, ffi::SQLITE_LOCKED] {
            let err = KvError::from(sqlite_failure(code));
            assert!(matches!(err, KvError::Conflict));
            assert!(err.is_retryable());
        }
    }

    #[test]
    fn test_other_sqlite_failures_are_fatal() {
        let err = KvError::from(sqlite_failure(ffi::SQLITE_CORRUPT));
        assert!(matches!(err, KvError::Backend(_)));
        assert!(!err.is_retryable());
        assert!(!KvError::RetryLimitExceeded(3).is_retryable());
    }
}
