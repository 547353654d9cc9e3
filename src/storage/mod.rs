//! Storage module for persisting crawl data
//!
//! This module handles:
//! - The [`RecordSink`] upsert contract and its SQLite and D1 backends
//! - SQLite schema initialization
//! - Crawl run tracking and resume checkpoints

mod d1;
mod schema;
mod sqlite;
mod traits;

pub use d1::{D1Config, D1Sink};
pub use schema::{record_table_sql, upsert_sql};
pub use sqlite::{SqliteSink, SqliteStorage, StoredRecord};
pub use traits::{RecordSink, RunStore, SinkError, StorageResult, UpsertOutcome};

use crate::CrawlError;
use serde::Serialize;
use std::path::Path;

/// Opens (or creates) the SQLite database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
/// * `table` - Record table name
///
/// # Returns
///
/// * `Ok(SqliteStorage)` - Successfully initialized storage
/// * `Err(CrawlError)` - Failed to initialize storage
pub fn open_storage(path: &Path, table: &str) -> Result<SqliteStorage, CrawlError> {
    SqliteStorage::new(path, table)
}

/// One deduplicated capture, ready for the sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    /// Deduplication unit, already normalized
    pub natural_key: String,
    pub url: String,
    pub timestamp: Option<String>,
    pub status_code: Option<u16>,
    pub mime_type: Option<String>,
    pub tag: Option<String>,
    pub title: Option<String>,
}

impl Record {
    /// Creates a record with only the key and URL set
    pub fn new(natural_key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            natural_key: natural_key.into(),
            url: url.into(),
            timestamp: None,
            status_code: None,
            mime_type: None,
            tag: None,
            title: None,
        }
    }
}

/// Represents a crawl run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub query_fingerprint: String,
    pub status: RunStatus,
    /// Cursor of the last page that was fully dispatched
    pub checkpoint_cursor: Option<String>,
    pub pages_fetched: u64,
    pub records_written: u64,
    pub terminated_reason: Option<String>,
}

/// Status of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}
