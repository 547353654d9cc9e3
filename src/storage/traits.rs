//! Storage traits and error types
//!
//! [`RecordSink`] is the async contract the crawler writes through.
//! [`RunStore`] holds crawl run bookkeeping and resume checkpoints.

use crate::storage::{Record, RunRecord, RunStatus};
use async_trait::async_trait;
use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur while writing records
#[derive(Debug, Error)]
pub enum SinkError {
    /// Worth retrying: rate limiting, server errors, a busy database
    #[error("Transient sink error: {0}")]
    Transient(String),

    /// Structural failure such as a missing table; retrying cannot help
    #[error("Fatal sink error: {0}")]
    Fatal(String),

    /// This record was refused; other records may still succeed
    #[error("Record rejected: {0}")]
    Rejected(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl SinkError {
    /// Returns true if the same write may succeed when repeated
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Fatal(_) | Self::Rejected(_) => false,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            Self::Sqlite(_) => false,
        }
    }

    /// Returns true if the sink can accept no further writes
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Fatal(_) => true,
            Self::Transient(_) | Self::Rejected(_) => false,
            Self::Sqlite(err) => is_schema_error(&err.to_string()),
        }
    }
}

/// Error messages SQLite (and D1) use for a missing table or column
pub(crate) fn is_schema_error(message: &str) -> bool {
    message.contains("no such table") || message.contains("no such column")
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, SinkError>;

/// What an upsert did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Destination for deduplicated records
///
/// `natural_key` is a uniqueness constraint: an upsert with an existing key
/// updates the mutable fields and `updated_at` and preserves `created_at`.
/// Implementations provide their own concurrency safety.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Checks that the sink is reachable
    async fn ping(&self) -> StorageResult<()>;

    /// Inserts the record or updates the stored one with the same key
    async fn upsert(&self, record: &Record) -> StorageResult<UpsertOutcome>;
}

/// Crawl run bookkeeping
pub trait RunStore {
    // ===== Run Management =====

    /// Creates a new crawl run
    ///
    /// # Arguments
    ///
    /// * `config_hash` - Hash of the configuration file
    /// * `query_fingerprint` - Fingerprint of the index query
    /// * `start_cursor` - Cursor the run starts from, if resumed
    ///
    /// # Returns
    ///
    /// The ID of the newly created run
    fn create_run(
        &mut self,
        config_hash: &str,
        query_fingerprint: &str,
        start_cursor: Option<&str>,
    ) -> StorageResult<i64>;

    /// Gets a run by ID
    fn get_run(&self, run_id: i64) -> StorageResult<Option<RunRecord>>;

    /// Gets the newest run for a query, if that run did not complete
    fn latest_unfinished_run(&self, query_fingerprint: &str) -> StorageResult<Option<RunRecord>>;

    /// Gets the most recent runs, newest first
    fn recent_runs(&self, limit: usize) -> StorageResult<Vec<RunRecord>>;

    /// Records the cursor a resumed run should start from
    fn save_checkpoint(
        &mut self,
        run_id: i64,
        cursor: Option<&str>,
        pages_fetched: u64,
        records_written: u64,
    ) -> StorageResult<()>;

    /// Marks a run as finished
    fn finish_run(
        &mut self,
        run_id: i64,
        status: RunStatus,
        terminated_reason: &str,
    ) -> StorageResult<()>;

    // ===== Statistics =====

    /// Gets total record count
    fn count_records(&self) -> StorageResult<u64>;

    /// Gets count of records carrying a tag
    fn count_tagged_records(&self) -> StorageResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SinkError::Transient("429".into()).is_transient());
        assert!(!SinkError::Transient("429".into()).is_fatal());
        assert!(SinkError::Fatal("no such table: x".into()).is_fatal());
        assert!(!SinkError::Fatal("x".into()).is_transient());
        let rejected = SinkError::Rejected("constraint".into());
        assert!(!rejected.is_transient());
        assert!(!rejected.is_fatal());
    }

    #[test]
    fn test_sqlite_missing_table_is_fatal() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err = conn
            .execute("INSERT INTO missing (a) VALUES (1)", [])
            .unwrap_err();
        let err = SinkError::from(err);
        assert!(err.is_fatal());
        assert!(!err.is_transient());
    }
}
