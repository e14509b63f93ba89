//! Error types for the permission store.

use std::path::PathBuf;

use thiserror::Error;

/// Failures of the grant store. Callers map every variant to `INTERNAL`.
#[derive(Debug, Error)]
pub enum PermissionError {
    /// `SQLite` rejected a statement.
    #[error("grant database: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// No pooled connection became available.
    #[error("grant database pool: {0}")]
    Pool(#[from] r2d2::Error),

    /// An allowlist column held something other than a JSON string array.
    #[error("allowlist encoding: {0}")]
    Serde(#[from] serde_json::Error),

    /// The database directory could not be created.
    #[error("cannot create {}: {source}", path.display())]
    CreateDir {
        /// Directory that failed.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// Schema migration failed.
    #[error("schema migration failed: {message}")]
    Migration {
        /// Which migration failed and why.
        message: String,
    },

    /// A persisted row could not be interpreted.
    #[error("corrupt grant row: {0}")]
    Corrupt(String),
}

/// Convenience type alias for permission store results.
pub type Result<T> = std::result::Result<T, PermissionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_error_display() {
        let err = PermissionError::Sqlite(rusqlite::Error::QueryReturnedNoRows);
        assert!(err.to_string().starts_with("grant database: "));
    }

    #[test]
    fn migration_error_display() {
        let err = PermissionError::Migration {
            message: "v1 failed".into(),
        };
        assert_eq!(err.to_string(), "schema migration failed: v1 failed");
    }
}
