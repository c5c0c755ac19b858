//! Error types for the group store.

use thiserror::Error;

/// Errors that can occur during group store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization/deserialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Describes which migration failed and why.
        message: String,
    },

    /// Requested group was not found.
    #[error("group not found: {0}")]
    GroupNotFound(String),

    /// A stored row could not be decoded.
    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        /// Table name.
        table: &'static str,
        /// Column name.
        column: &'static str,
        /// What was wrong.
        detail: String,
    },
}

/// Convenience type alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_error_display() {
        let err = StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows);
        assert!(err.to_string().contains("sqlite error"));
    }

    #[test]
    fn group_not_found_display() {
        let err = StoreError::GroupNotFound("grp_1".into());
        assert_eq!(err.to_string(), "group not found: grp_1");
    }

    #[test]
    fn corrupt_row_display() {
        let err = StoreError::CorruptRow {
            table: "group_results",
            column: "state",
            detail: "unknown variant: CLOSED".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt row in group_results.state: unknown variant: CLOSED"
        );
    }

    #[test]
    fn serde_error_from_conversion() {
        let serde_err = serde_json::from_str::<String>("not json").unwrap_err();
        let err: StoreError = serde_err.into();
        assert!(matches!(err, StoreError::Serde(_)));
    }
}
