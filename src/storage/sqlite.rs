//! SQLite storage implementation
//!
//! [`SqliteStorage`] owns the connection and implements [`RunStore`].
//! [`SqliteSink`] shares it behind a mutex and implements [`RecordSink`],
//! running each statement on tokio's blocking pool.

use crate::storage::schema::{initialize_schema, upsert_sql};
use crate::storage::traits::{RecordSink, RunStore, SinkError, StorageResult, UpsertOutcome};
use crate::storage::{Record, RunRecord, RunStatus};
use crate::CrawlError;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

const RUN_COLUMNS: &str = "id, started_at, finished_at, config_hash, query_fingerprint, status,
     checkpoint_cursor, pages_fetched, records_written, terminated_reason";

/// A record as stored, with its bookkeeping timestamps
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub record: Record,
    pub created_at: String,
    pub updated_at: String,
}

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
    table: String,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    /// * `table` - Record table name, already validated as an identifier
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(CrawlError)` - Failed to open database
    pub fn new(path: &Path, table: &str) -> Result<Self, CrawlError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        initialize_schema(&conn, table)?;

        Ok(Self {
            conn,
            table: table.to_string(),
        })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory(table: &str) -> Result<Self, CrawlError> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn, table)?;
        Ok(Self {
            conn,
            table: table.to_string(),
        })
    }

    /// Record table name
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Inserts or updates one record, reporting which happened
    pub fn upsert_record(&mut self, record: &Record) -> StorageResult<UpsertOutcome> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;

        let existed = tx
            .query_row(
                &format!("SELECT 1 FROM {} WHERE natural_key = ?1", self.table),
                params![record.natural_key],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        tx.execute(
            &upsert_sql(&self.table),
            params![
                record.natural_key,
                record.url,
                record.timestamp,
                record.status_code,
                record.mime_type,
                record.tag,
                record.title,
                now,
            ],
        )?;
        tx.commit()?;

        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    /// Gets a stored record by natural key
    pub fn get_record(&self, natural_key: &str) -> StorageResult<Option<StoredRecord>> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "SELECT natural_key, url, timestamp, status_code, mime_type, tag, title,
                     created_at, updated_at FROM {} WHERE natural_key = ?1",
                    self.table
                ),
                params![natural_key],
                |row| {
                    Ok(StoredRecord {
                        record: Record {
                            natural_key: row.get(0)?,
                            url: row.get(1)?,
                            timestamp: row.get(2)?,
                            status_code: row.get(3)?,
                            mime_type: row.get(4)?,
                            tag: row.get(5)?,
                            title: row.get(6)?,
                        },
                        created_at: row.get(7)?,
                        updated_at: row.get(8)?,
                    })
                },
            )
            .optional()?;

        Ok(record)
    }

    /// All natural keys, sorted
    pub fn natural_keys(&self) -> StorageResult<Vec<String>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT natural_key FROM {} ORDER BY natural_key",
            self.table
        ))?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    fn ping(&self) -> StorageResult<()> {
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| {
                row.get::<_, i64>(0)
            })?;
        Ok(())
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        config_hash: row.get(3)?,
        query_fingerprint: row.get(4)?,
        status: RunStatus::from_db_string(&row.get::<_, String>(5)?)
            .unwrap_or(RunStatus::Failed),
        checkpoint_cursor: row.get(6)?,
        pages_fetched: row.get::<_, i64>(7)?.max(0) as u64,
        records_written: row.get::<_, i64>(8)?.max(0) as u64,
        terminated_reason: row.get(9)?,
    })
}

impl RunStore for SqliteStorage {
    // ===== Run Management =====

    fn create_run(
        &mut self,
        config_hash: &str,
        query_fingerprint: &str,
        start_cursor: Option<&str>,
    ) -> StorageResult<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO crawl_runs (started_at, config_hash, query_fingerprint, status, checkpoint_cursor)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                now,
                config_hash,
                query_fingerprint,
                RunStatus::Running.to_db_string(),
                start_cursor
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_run(&self, run_id: i64) -> StorageResult<Option<RunRecord>> {
        let run = self
            .conn
            .query_row(
                &format!("SELECT {} FROM crawl_runs WHERE id = ?1", RUN_COLUMNS),
                params![run_id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    fn latest_unfinished_run(&self, query_fingerprint: &str) -> StorageResult<Option<RunRecord>> {
        // Only the newest run counts; an older unfinished run was superseded
        let run = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM crawl_runs WHERE query_fingerprint = ?1
                     ORDER BY id DESC LIMIT 1",
                    RUN_COLUMNS
                ),
                params![query_fingerprint],
                run_from_row,
            )
            .optional()?;
        Ok(run.filter(|r| r.status != RunStatus::Completed))
    }

    fn recent_runs(&self, limit: usize) -> StorageResult<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM crawl_runs ORDER BY id DESC LIMIT ?1",
            RUN_COLUMNS
        ))?;
        let runs = stmt
            .query_map(params![limit as i64], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    fn save_checkpoint(
        &mut self,
        run_id: i64,
        cursor: Option<&str>,
        pages_fetched: u64,
        records_written: u64,
    ) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE crawl_runs SET checkpoint_cursor = ?1, pages_fetched = ?2, records_written = ?3
             WHERE id = ?4",
            params![cursor, pages_fetched as i64, records_written as i64, run_id],
        )?;
        Ok(())
    }

    fn finish_run(
        &mut self,
        run_id: i64,
        status: RunStatus,
        terminated_reason: &str,
    ) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE crawl_runs SET status = ?1, finished_at = ?2, terminated_reason = ?3 WHERE id = ?4",
            params![status.to_db_string(), now, terminated_reason, run_id],
        )?;
        Ok(())
    }

    // ===== Statistics =====

    fn count_records(&self) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn count_tagged_records(&self) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE tag IS NOT NULL", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

/// [`RecordSink`] over a shared [`SqliteStorage`]
#[derive(Clone)]
pub struct SqliteSink {
    storage: Arc<Mutex<SqliteStorage>>,
}

impl SqliteSink {
    pub fn new(storage: Arc<Mutex<SqliteStorage>>) -> Self {
        Self { storage }
    }

    /// Runs `op` against the storage without blocking the async workers
    async fn blocking<T, F>(&self, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteStorage) -> StorageResult<T> + Send + 'static,
    {
        let storage = Arc::clone(&self.storage);
        tokio::task::spawn_blocking(move || {
            let mut storage = storage
                .lock()
                .map_err(|_| SinkError::Fatal("storage lock poisoned".to_string()))?;
            op(&mut storage)
        })
        .await
        .map_err(|e| SinkError::Fatal(format!("storage task failed: {}", e)))?
    }
}

#[async_trait]
impl RecordSink for SqliteSink {
    async fn ping(&self) -> StorageResult<()> {
        self.blocking(|storage| storage.ping()).await
    }

    async fn upsert(&self, record: &Record) -> StorageResult<UpsertOutcome> {
        let record = record.clone();
        self.blocking(move |storage| storage.upsert_record(&record))
            .await
    }
}
