//! Cloudflare D1 record sink
//!
//! D1 is SQLite behind an HTTP API, so the record table DDL and upsert
//! statement are the same ones the local backend uses. Each statement is a
//! POST of `{"sql", "params"}` to the database's `/query` endpoint.

use crate::config::OutputConfig;
use crate::storage::schema::{record_table_sql, upsert_sql};
use crate::storage::traits::{is_schema_error, RecordSink, SinkError, StorageResult, UpsertOutcome};
use crate::storage::Record;
use crate::ConfigError;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

/// Connection settings for a D1 database
#[derive(Debug, Clone)]
pub struct D1Config {
    pub api_base: String,
    pub account_id: String,
    pub database_id: String,
    pub api_token: String,
    pub table: String,
}

impl D1Config {
    /// Builds the settings from the output config, reading the token from
    /// the configured environment variable
    pub fn from_output(output: &OutputConfig) -> Result<Self, ConfigError> {
        let api_token = std::env::var(&output.d1_api_token_env)
            .map_err(|_| ConfigError::MissingEnv(output.d1_api_token_env.clone()))?;

        let required = |value: &Option<String>, name: &str| {
            value
                .clone()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ConfigError::Validation(format!("{} is required", name)))
        };

        Ok(Self {
            api_base: output.d1_api_base.trim_end_matches('/').to_string(),
            account_id: required(&output.d1_account_id, "d1_account_id")?,
            database_id: required(&output.d1_database_id, "d1_database_id")?,
            api_token,
            table: output.table.clone(),
        })
    }

    fn database_url(&self) -> String {
        format!(
            "{}/accounts/{}/d1/database/{}",
            self.api_base, self.account_id, self.database_id
        )
    }
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    sql: &'a str,
    params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct D1Message {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct D1Status {
    success: bool,
    #[serde(default)]
    errors: Vec<D1Message>,
}

#[derive(Debug, Deserialize)]
struct D1QueryResponse {
    success: bool,
    #[serde(default)]
    errors: Vec<D1Message>,
    #[serde(default)]
    result: Vec<D1QueryResult>,
}

#[derive(Debug, Deserialize)]
struct D1QueryResult {
    #[serde(default)]
    results: Vec<Map<String, Value>>,
}

/// [`RecordSink`] writing to Cloudflare D1
pub struct D1Sink {
    client: Client,
    database_url: String,
    query_url: String,
    api_token: String,
    table: String,
    upsert_sql: String,
}

impl D1Sink {
    pub fn new(client: Client, config: D1Config) -> Self {
        let database_url = config.database_url();
        let query_url = format!("{}/query", database_url);
        let upsert_sql = format!(
            "{} RETURNING created_at, updated_at",
            upsert_sql(&config.table)
        );
        Self {
            client,
            database_url,
            query_url,
            api_token: config.api_token,
            table: config.table,
            upsert_sql,
        }
    }

    /// Creates the record table if it does not exist
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        for statement in record_table_sql(&self.table).split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                self.query(statement, Vec::new()).await?;
            }
        }
        Ok(())
    }

    /// Runs one statement and returns its result rows
    async fn query(&self, sql: &str, params: Vec<Value>) -> StorageResult<Vec<Map<String, Value>>> {
        let response = self
            .client
            .post(&self.query_url)
            .bearer_auth(&self.api_token)
            .json(&QueryRequest { sql, params })
            .send()
            .await
            .map_err(|e| SinkError::Transient(format!("D1 request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SinkError::Transient(format!("D1 response unreadable: {}", e)))?;

        let parsed: Option<D1QueryResponse> = serde_json::from_str(&body).ok();
        match parsed {
            Some(parsed) if status.is_success() && parsed.success => {
                debug!("D1 query ok ({} result sets)", parsed.result.len());
                Ok(parsed
                    .result
                    .into_iter()
                    .next()
                    .map(|r| r.results)
                    .unwrap_or_default())
            }
            Some(parsed) => Err(classify_failure(status, &parsed.errors, &body)),
            None => Err(classify_failure(status, &[], &body)),
        }
    }
}

/// Maps a failed D1 call onto the sink error taxonomy
fn classify_failure(status: StatusCode, errors: &[D1Message], body: &str) -> SinkError {
    let message = if errors.is_empty() {
        format!("HTTP {}: {}", status.as_u16(), body)
    } else {
        errors
            .iter()
            .map(|e| format!("[{}] {}", e.code, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    };

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SinkError::Transient(message)
    } else if is_schema_error(&message)
        || status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || status == StatusCode::NOT_FOUND
    {
        SinkError::Fatal(message)
    } else {
        SinkError::Rejected(message)
    }
}

#[async_trait]
impl RecordSink for D1Sink {
    async fn ping(&self) -> StorageResult<()> {
        let response = self
            .client
            .get(&self.database_url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| SinkError::Transient(format!("D1 unreachable: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<D1Status>(&body) {
            Ok(parsed) if status.is_success() && parsed.success => Ok(()),
            Ok(parsed) => Err(classify_failure(status, &parsed.errors, &body)),
            Err(_) => Err(classify_failure(status, &[], &body)),
        }
    }

    async fn upsert(&self, record: &Record) -> StorageResult<UpsertOutcome> {
        let now = Utc::now().to_rfc3339();
        let params = vec![
            json!(record.natural_key),
            json!(record.url),
            json!(record.timestamp),
            json!(record.status_code),
            json!(record.mime_type),
            json!(record.tag),
            json!(record.title),
            json!(now),
        ];

        let rows = self.query(&self.upsert_sql, params).await?;

        // created_at is only written on insert
        let inserted = rows
            .first()
            .map(|row| row.get("created_at") == row.get("updated_at"))
            .unwrap_or(false);

        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }
}
