//! Per-record processing
//!
//! [`SinkWriter`] is the session's [`RecordProcessor`]: it optionally fetches
//! the record's page to fill in the title, then upserts the record, retrying
//! transient sink errors with backoff.

use crate::crawler::dispatcher::{ItemError, RecordProcessor};
use crate::crawler::fetcher::FetchResult;
use crate::crawler::parser::extract_title;
use crate::crawler::retry::{BackoffPolicy, RetryingFetcher};
use crate::storage::{Record, RecordSink, SinkError, UpsertOutcome};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Writes records into a [`RecordSink`]
pub struct SinkWriter {
    sink: Arc<dyn RecordSink>,
    policy: BackoffPolicy,
    details: Option<(RetryingFetcher, Duration)>,
}

impl SinkWriter {
    pub fn new(sink: Arc<dyn RecordSink>, policy: BackoffPolicy) -> Self {
        Self {
            sink,
            policy,
            details: None,
        }
    }

    /// Fetches each record's page before writing and stores its title
    pub fn with_detail_fetch(mut self, fetcher: RetryingFetcher, timeout: Duration) -> Self {
        self.details = Some((fetcher, timeout));
        self
    }

    /// Upserts `record`, retrying transient errors up to the policy's budget
    pub async fn write(&self, record: &Record) -> Result<UpsertOutcome, ItemError> {
        let mut attempt: u32 = 0;
        loop {
            let err = match self.sink.upsert(record).await {
                Ok(outcome) => {
                    trace!("{:?} {}", outcome, record.natural_key);
                    return Ok(outcome);
                }
                Err(err) => err,
            };

            if err.is_fatal() {
                return Err(ItemError::Fatal(err.to_string()));
            }
            if !err.is_transient() || attempt >= self.policy.max_retries {
                return Err(ItemError::Failed(describe(&err, attempt)));
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                "Upsert of {} failed ({}); retrying in {:?}",
                record.natural_key, err, delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn fetch_title(&self, record: &mut Record) -> Result<(), ItemError> {
        let (fetcher, timeout) = match &self.details {
            Some(details) => details,
            None => return Ok(()),
        };

        match fetcher.fetch(&record.url, *timeout).await {
            FetchResult::Success { body, .. } => {
                record.title = extract_title(&body);
                debug!("Title for {}: {:?}", record.url, record.title);
                Ok(())
            }
            FetchResult::Failure(failure) => Err(ItemError::Failed(format!(
                "detail fetch for {} failed: {}",
                record.url, failure
            ))),
        }
    }
}

fn describe(err: &SinkError, retries: u32) -> String {
    if retries == 0 {
        err.to_string()
    } else {
        format!("{} (after {} retries)", err, retries)
    }
}

#[async_trait]
impl RecordProcessor for SinkWriter {
    async fn process(&self, mut record: Record) -> Result<(), ItemError> {
        self.fetch_title(&mut record).await?;
        self.write(&record).await.map(|_| ())
    }
}
