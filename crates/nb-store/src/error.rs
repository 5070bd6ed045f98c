//! Store errors and transient/duplicate classification.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

const UNIQUE_VIOLATION: &str = "23505";
const DEADLOCK_DETECTED: &str = "40P01";

/// Error substrings worth a retry with a fresh connection.
const RETRYABLE_FRAGMENTS: &[&str] = &[
    "connection",
    "server closed",
    "broken pipe",
    "timeout",
    "deadlock",
    "lock timeout",
];

/// Duplicate-key insert: the row already exists, idempotent skip.
pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION)
    )
}

/// Transient faults: connection-level trouble, timeouts, deadlocks.
/// Anything else surfaces on the first attempt.
pub fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => return true,
        sqlx::Error::Database(db) if db.code().as_deref() == Some(DEADLOCK_DETECTED) => {
            return true
        }
        _ => {}
    }

    let text = error.to_string().to_ascii_lowercase();
    RETRYABLE_FRAGMENTS
        .iter()
        .any(|fragment| text.contains(fragment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn io_and_pool_errors_are_transient() {
        assert!(is_transient(&sqlx::Error::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "broken pipe"
        ))));
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(is_transient(&sqlx::Error::PoolClosed));
    }

    #[test]
    fn retryable_fragments_match_case_insensitively() {
        assert!(is_transient(&sqlx::Error::Protocol(
            "Server closed the connection unexpectedly".into()
        )));
        assert!(is_transient(&sqlx::Error::Protocol(
            "Deadlock detected while waiting for lock".into()
        )));
        assert!(is_transient(&sqlx::Error::Protocol(
            "statement timeout exceeded".into()
        )));
    }

    #[test]
    fn plain_sql_errors_are_not_transient() {
        assert!(!is_transient(&sqlx::Error::RowNotFound));
        assert!(!is_transient(&sqlx::Error::Protocol(
            "syntax error at or near SELECT".into()
        )));
    }

    #[test]
    fn unique_violation_needs_the_sqlstate() {
        // Without a database-backed error there is no SQLSTATE to match.
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
        assert!(!is_unique_violation(&sqlx::Error::Protocol(
            "duplicate key value violates unique constraint".into()
        )));
    }
}
