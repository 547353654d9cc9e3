//! Database schema definitions
//!
//! The run table has a fixed name. The record table name comes from the
//! output config, so its DDL and upsert statement are built per table.

/// SQL schema for crawl run bookkeeping
pub const SCHEMA_SQL: &str = r#"
-- Track crawl runs and their resume checkpoints
CREATE TABLE IF NOT EXISTS crawl_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    config_hash TEXT NOT NULL,
    query_fingerprint TEXT NOT NULL,
    status TEXT NOT NULL,
    checkpoint_cursor TEXT,
    pages_fetched INTEGER NOT NULL DEFAULT 0,
    records_written INTEGER NOT NULL DEFAULT 0,
    terminated_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_crawl_runs_fingerprint ON crawl_runs(query_fingerprint);
"#;

/// DDL for the record table
///
/// `table` must already be validated as a plain identifier.
pub fn record_table_sql(table: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    natural_key TEXT NOT NULL UNIQUE,
    url TEXT NOT NULL,
    timestamp TEXT,
    status_code INTEGER,
    mime_type TEXT,
    tag TEXT,
    title TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_{table}_tag ON {table}(tag);
"#
    )
}

/// Insert-or-update keyed on `natural_key`
///
/// Parameters: `?1` natural_key, `?2` url, `?3` timestamp, `?4` status_code,
/// `?5` mime_type, `?6` tag, `?7` title, `?8` now. `created_at` is only
/// written on insert. A missing tag or title keeps the stored value.
pub fn upsert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} (natural_key, url, timestamp, status_code, mime_type, tag, title, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
         ON CONFLICT(natural_key) DO UPDATE SET
             url = excluded.url,
             timestamp = excluded.timestamp,
             status_code = excluded.status_code,
             mime_type = excluded.mime_type,
             tag = COALESCE(excluded.tag, {table}.tag),
             title = COALESCE(excluded.title, {table}.title),
             updated_at = excluded.updated_at"
    )
}

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
/// * `table` - Record table name
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection, table: &str) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(&record_table_sql(table))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_initializes() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(initialize_schema(&conn, "archive_records").is_ok());
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        initialize_schema(&conn, "archive_records").unwrap();
        let result = initialize_schema(&conn, "archive_records");

        assert!(result.is_ok());
    }

    #[test]
    fn test_tables_exist_after_init() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn, "hashtags").unwrap();

        for table in ["crawl_runs", "hashtags"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_upsert_preserves_created_at() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn, "t").unwrap();
        let sql = upsert_sql("t");

        conn.execute(
            &sql,
            rusqlite::params!["k", "http://a/1", None::<String>, 200, None::<String>, None::<String>, "One", "2024-01-01"],
        )
        .unwrap();
        conn.execute(
            &sql,
            rusqlite::params!["k", "http://a/2", None::<String>, 200, None::<String>, None::<String>, None::<String>, "2024-02-02"],
        )
        .unwrap();

        let (url, title, created, updated): (String, String, String, String) = conn
            .query_row(
                "SELECT url, title, created_at, updated_at FROM t WHERE natural_key = 'k'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .unwrap();
        assert_eq!(url, "http://a/2");
        assert_eq!(title, "One");
        assert_eq!(created, "2024-01-01");
        assert_eq!(updated, "2024-02-02");
    }
}
