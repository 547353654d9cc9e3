//! Crawl session - main crawl orchestration logic
//!
//! A [`CrawlSession`] wires the pieces of a crawl together:
//! - [`CursorPager`] pulls index pages one at a time
//! - [`Deduplicator`] turns URLs into natural keys and drops repeats
//! - [`ConcurrentDispatcher`] runs [`SinkWriter`] on each new record
//! - a [`RunStore`] keeps resume checkpoints between sessions

use crate::config::{Config, SinkBackend};
use crate::crawler::dedup::Deduplicator;
use crate::crawler::dispatcher::ConcurrentDispatcher;
use crate::crawler::fetcher::{build_http_client, HttpFetcher};
use crate::crawler::pager::CursorPager;
use crate::crawler::parser::IndexEntry;
use crate::crawler::query::IndexQuery;
use crate::crawler::rate_limiter::RateLimiter;
use crate::crawler::retry::{BackoffPolicy, RetryingFetcher};
use crate::crawler::worker::SinkWriter;
use crate::state::TerminationReason;
use crate::storage::{
    open_storage, D1Config, D1Sink, Record, RecordSink, RunStatus, RunStore, SqliteSink,
};
use crate::url::{NormalizationPolicy, Normalizer};
use crate::CrawlError;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters reported at every page boundary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionProgress {
    pub pages_fetched: u64,
    pub records_seen: u64,
    pub records_written: u64,
    pub records_skipped_duplicate: u64,
    pub records_failed: u64,
    /// Cursor of the page just dispatched
    pub cursor: Option<String>,
}

/// Called after each page has been dispatched
pub type ProgressCallback = Arc<dyn Fn(&SessionProgress) + Send + Sync>;

/// Result of one crawl session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Index pages that carried data rows
    pub pages_fetched: u64,
    /// Index entries taken from those pages
    pub records_seen: u64,
    pub records_written: u64,
    pub records_skipped_duplicate: u64,
    /// Failed detail fetches, rejected upserts and unusable keys
    pub records_failed: u64,
    pub terminated_reason: TerminationReason,
    /// Cursor of the last page that was fully dispatched
    pub last_cursor: Option<String>,
    /// Run row in the checkpoint store, if one is attached
    pub run_id: Option<i64>,
}

struct Checkpoints {
    store: Arc<Mutex<dyn RunStore + Send>>,
    config_hash: String,
    fresh: bool,
}

impl Checkpoints {
    fn lock(&self) -> Result<MutexGuard<'_, dyn RunStore + Send + 'static>, CrawlError> {
        self.store
            .lock()
            .map_err(|_| CrawlError::SinkUnavailable("run store lock poisoned".to_string()))
    }
}

/// One end-to-end crawl over an [`IndexQuery`]
pub struct CrawlSession {
    fetcher: RetryingFetcher,
    sink: Arc<dyn RecordSink>,
    normalizer: Normalizer,
    tag_keys: bool,
    concurrency: usize,
    request_timeout: Duration,
    sink_policy: BackoffPolicy,
    fetch_details: bool,
    max_total_items: u64,
    cancel: CancellationToken,
    progress: Option<ProgressCallback>,
    checkpoints: Option<Checkpoints>,
}

impl CrawlSession {
    /// Creates a session with default settings
    pub fn new(fetcher: RetryingFetcher, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            fetcher,
            sink,
            normalizer: NormalizationPolicy::default().normalizer(),
            tag_keys: false,
            concurrency: 10,
            request_timeout: Duration::from_secs(300),
            sink_policy: BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(60), 3),
            fetch_details: false,
            max_total_items: 0,
            cancel: CancellationToken::new(),
            progress: None,
            checkpoints: None,
        }
    }

    /// Creates a session using the `[crawler]` and `[source]` settings
    pub fn from_config(config: &Config, fetcher: RetryingFetcher, sink: Arc<dyn RecordSink>) -> Self {
        Self::new(fetcher, sink)
            .with_normalization(config.source.normalization)
            .with_concurrency(config.crawler.concurrency as usize)
            .with_request_timeout(Duration::from_secs(config.crawler.request_timeout_secs))
            .with_sink_policy(BackoffPolicy::for_sink(&config.crawler))
            .with_detail_fetch(config.crawler.fetch_details)
            .with_max_total_items(config.crawler.max_total_items)
    }

    pub fn with_normalization(mut self, policy: NormalizationPolicy) -> Self {
        self.normalizer = policy.normalizer();
        self.tag_keys = policy.produces_tags();
        self
    }

    /// Uses a custom key rule; `tag_keys` also stores the key as the tag
    pub fn with_normalizer(mut self, normalizer: Normalizer, tag_keys: bool) -> Self {
        self.normalizer = normalizer;
        self.tag_keys = tag_keys;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_sink_policy(mut self, policy: BackoffPolicy) -> Self {
        self.sink_policy = policy;
        self
    }

    pub fn with_detail_fetch(mut self, enabled: bool) -> Self {
        self.fetch_details = enabled;
        self
    }

    /// Stops after this many index entries; 0 means no limit
    pub fn with_max_total_items(mut self, max: u64) -> Self {
        self.max_total_items = max;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Records the run and its checkpoints in `store`
    ///
    /// Unless `fresh` is set, a query whose newest run did not complete
    /// resumes from that run's checkpoint.
    pub fn with_checkpoints(
        mut self,
        store: Arc<Mutex<dyn RunStore + Send>>,
        config_hash: impl Into<String>,
        fresh: bool,
    ) -> Self {
        self.checkpoints = Some(Checkpoints {
            store,
            config_hash: config_hash.into(),
            fresh,
        });
        self
    }

    /// Token that stops the session when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the crawl to a terminal condition
    ///
    /// # Errors
    ///
    /// Only setup failures are returned: an invalid query, an unreachable
    /// sink, or a checkpoint store that cannot record the run. Per-record
    /// failures are counted in the summary.
    pub async fn run(&self, query: IndexQuery) -> Result<SessionSummary, CrawlError> {
        let mut query = query;
        query.validate()?;
        let fingerprint = query.fingerprint()?;

        self.sink
            .ping()
            .await
            .map_err(|e| CrawlError::SinkUnavailable(e.to_string()))?;

        let run_id = match &self.checkpoints {
            Some(checkpoints) => Some(self.start_run(checkpoints, &mut query, &fingerprint)?),
            None => None,
        };

        let dedup = Arc::new(Deduplicator::new(Arc::clone(&self.normalizer)));
        let mut writer = SinkWriter::new(Arc::clone(&self.sink), self.sink_policy);
        if self.fetch_details {
            writer = writer.with_detail_fetch(self.fetcher.clone(), self.request_timeout);
        }
        let mut dispatcher =
            ConcurrentDispatcher::new(Arc::new(writer), Arc::clone(&dedup), self.concurrency)?
                .with_cancellation(self.cancel.clone());

        info!(
            "Starting {} crawl of '{}' (run {:?}, concurrency {})",
            query.format, query.domain_filter, run_id, self.concurrency
        );
        if let Some(cursor) = &query.resume_key {
            info!("Starting from cursor {}", cursor);
        }

        let start_time = Instant::now();
        let mut pager = CursorPager::new(query, self.fetcher.clone(), self.request_timeout);
        let mut records_seen: u64 = 0;
        let mut unusable_keys: u64 = 0;
        let mut checkpoint = pager.cursor().map(str::to_string);
        let mut stop: Option<TerminationReason> = None;

        while stop.is_none() {
            let page = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    stop = Some(TerminationReason::Cancelled);
                    break;
                }
                page = pager.next_page() => page,
            };
            let page = match page {
                Some(page) => page,
                None => break,
            };

            if page.rejected_rows > 0 {
                debug!("{} rows without a URL on {}", page.rejected_rows, page.url);
            }

            let mut page_complete = true;
            for entry in page.entries {
                if self.limit_reached(records_seen) {
                    stop = Some(TerminationReason::LimitReached);
                    page_complete = false;
                    break;
                }
                if self.cancel.is_cancelled() {
                    stop = Some(TerminationReason::Cancelled);
                    page_complete = false;
                    break;
                }

                records_seen += 1;
                let record = match self.to_record(&dedup, entry) {
                    Some(record) => record,
                    None => {
                        unusable_keys += 1;
                        continue;
                    }
                };

                if !dispatcher.dispatch(record).await {
                    if self.cancel.is_cancelled() {
                        stop = Some(TerminationReason::Cancelled);
                    }
                    page_complete = false;
                    break;
                }
            }

            // A page's records are stored before its cursor is
            let stats = dispatcher.drain().await;
            if dispatcher.is_aborted() {
                stop = Some(TerminationReason::SinkFatal);
                page_complete = false;
            } else if stop.is_none() && self.limit_reached(records_seen) {
                stop = Some(TerminationReason::LimitReached);
            }

            let progress = SessionProgress {
                pages_fetched: pager.pages_fetched(),
                records_seen,
                records_written: stats.records_written,
                records_skipped_duplicate: stats.records_skipped_duplicate,
                records_failed: stats.records_failed + unusable_keys,
                cursor: page.cursor.clone(),
            };

            if page_complete {
                checkpoint = page.cursor;
                self.save_checkpoint(run_id, checkpoint.as_deref(), &progress);
            }

            info!(
                "Page {}: {} seen, {} written, {} duplicates, {} failed ({:.1}s)",
                progress.pages_fetched,
                progress.records_seen,
                progress.records_written,
                progress.records_skipped_duplicate,
                progress.records_failed,
                start_time.elapsed().as_secs_f64()
            );
            if let Some(callback) = &self.progress {
                callback(&progress);
            }
        }

        let terminated_reason = stop
            .or_else(|| pager.termination())
            .unwrap_or(TerminationReason::Exhausted);

        if terminated_reason == TerminationReason::Cancelled {
            info!("Cancelled; waiting for in-flight records");
        }
        let stats = dispatcher.drain().await;
        if let Some(message) = dispatcher.fatal_error() {
            error!("Batch aborted by sink: {}", message);
        }
        if let Some(failure) = pager.last_failure() {
            error!("Index fetch failed: {}", failure);
        }

        let summary = SessionSummary {
            pages_fetched: pager.pages_fetched(),
            records_seen,
            records_written: stats.records_written,
            records_skipped_duplicate: stats.records_skipped_duplicate,
            records_failed: stats.records_failed + unusable_keys,
            terminated_reason,
            last_cursor: checkpoint,
            run_id,
        };

        self.finish_run(&summary);

        info!(
            "Crawl finished ({}): {} pages, {} written, {} duplicates, {} failed in {:?}",
            summary.terminated_reason,
            summary.pages_fetched,
            summary.records_written,
            summary.records_skipped_duplicate,
            summary.records_failed,
            start_time.elapsed()
        );

        Ok(summary)
    }

    fn limit_reached(&self, records_seen: u64) -> bool {
        self.max_total_items > 0 && records_seen >= self.max_total_items
    }

    /// Builds the record for an index entry, or `None` if its key is unusable
    fn to_record(&self, dedup: &Deduplicator, entry: IndexEntry) -> Option<Record> {
        let natural_key = match dedup.normalize(&entry.url) {
            Some(key) => key,
            None => {
                warn!("Skipping {}: no usable key", entry.url);
                return None;
            }
        };

        Some(Record {
            tag: self.tag_keys.then(|| natural_key.clone()),
            natural_key,
            url: entry.url,
            timestamp: entry.timestamp,
            status_code: entry.status_code,
            mime_type: entry.mime_type,
            title: None,
        })
    }

    /// Creates the run row, picking up an earlier checkpoint when allowed
    fn start_run(
        &self,
        checkpoints: &Checkpoints,
        query: &mut IndexQuery,
        fingerprint: &str,
    ) -> Result<i64, CrawlError> {
        let mut store = checkpoints.lock()?;

        if !checkpoints.fresh && query.resume_key.is_none() && query.supports_resume() {
            if let Some(previous) = store.latest_unfinished_run(fingerprint)? {
                match previous.checkpoint_cursor {
                    Some(cursor) => {
                        info!("Resuming interrupted run {} at cursor {}", previous.id, cursor);
                        query.resume_key = Some(cursor);
                    }
                    None => info!(
                        "Run {} stopped before its first page; starting over",
                        previous.id
                    ),
                }
            }
        }

        let run_id = store.create_run(
            &checkpoints.config_hash,
            fingerprint,
            query.resume_key.as_deref(),
        )?;
        Ok(run_id)
    }

    fn save_checkpoint(&self, run_id: Option<i64>, cursor: Option<&str>, progress: &SessionProgress) {
        let (checkpoints, run_id) = match (&self.checkpoints, run_id) {
            (Some(checkpoints), Some(run_id)) => (checkpoints, run_id),
            _ => return,
        };

        let result = checkpoints.lock().and_then(|mut store| {
            store
                .save_checkpoint(
                    run_id,
                    cursor,
                    progress.pages_fetched,
                    progress.records_written,
                )
                .map_err(CrawlError::from)
        });
        if let Err(e) = result {
            warn!("Failed to save checkpoint for run {}: {}", run_id, e);
        }
    }

    fn finish_run(&self, summary: &SessionSummary) {
        let (checkpoints, run_id) = match (&self.checkpoints, summary.run_id) {
            (Some(checkpoints), Some(run_id)) => (checkpoints, run_id),
            _ => return,
        };

        let status = run_status(summary.terminated_reason);
        let result = checkpoints.lock().and_then(|mut store| {
            store.save_checkpoint(
                run_id,
                summary.last_cursor.as_deref(),
                summary.pages_fetched,
                summary.records_written,
            )?;
            store.finish_run(run_id, status, summary.terminated_reason.as_str())?;
            Ok(())
        });
        if let Err(e) = result {
            warn!("Failed to finish run {}: {}", run_id, e);
        }
    }
}

/// How a termination reason is recorded on the run
///
/// Cancelled and limited runs stay resumable.
fn run_status(reason: TerminationReason) -> RunStatus {
    match reason {
        TerminationReason::Exhausted
        | TerminationReason::NoProgress
        | TerminationReason::ProtocolError => RunStatus::Completed,
        TerminationReason::Cancelled | TerminationReason::LimitReached => RunStatus::Interrupted,
        TerminationReason::FetchError | TerminationReason::SinkFatal => RunStatus::Failed,
    }
}

/// Options for [`run_crawl`]
#[derive(Clone, Default)]
pub struct CrawlOptions {
    /// Ignore earlier checkpoints for the same query
    pub fresh: bool,
    /// Hash of the configuration file, stored on the run
    pub config_hash: String,
    pub cancel: CancellationToken,
    pub progress: Option<ProgressCallback>,
}

/// Runs the crawl described by `config`
///
/// This function builds everything a session needs:
///
/// 1. The index query from `[source]`
/// 2. The HTTP client, rate limiter and retrying fetcher
/// 3. The SQLite database (run checkpoints, and records for the SQLite backend)
/// 4. The record sink; for D1 the record table is created first
/// 5. The session, which then runs to completion
///
/// # Arguments
///
/// * `config` - The crawler configuration
/// * `options` - Resume, cancellation and progress options
///
/// # Returns
///
/// * `Ok(SessionSummary)` - The session ran; see its termination reason
/// * `Err(CrawlError)` - Setup failed
///
/// # Example
///
/// ```no_run
/// use archive_crawl::config::load_config_with_hash;
/// use archive_crawl::crawler::{run_crawl, CrawlOptions};
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (config, config_hash) = load_config_with_hash(Path::new("config.toml"))?;
/// let options = CrawlOptions {
///     config_hash,
///     ..CrawlOptions::default()
/// };
/// let summary = run_crawl(&config, options).await?;
/// println!("{} records written", summary.records_written);
/// # Ok(())
/// # }
/// ```
pub async fn run_crawl(config: &Config, options: CrawlOptions) -> Result<SessionSummary, CrawlError> {
    let query = IndexQuery::from_source(&config.source)?;

    let client = build_http_client(&config.user_agent)?;
    let limiter = RateLimiter::new(Duration::from_millis(config.crawler.sleep_between_pages_ms));
    let fetcher = RetryingFetcher::new(
        Arc::new(HttpFetcher::new(client.clone())),
        Arc::new(limiter),
        BackoffPolicy::for_requests(&config.crawler),
    );

    let storage = Arc::new(Mutex::new(open_storage(
        Path::new(&config.output.database_path),
        &config.output.table,
    )?));

    let sink: Arc<dyn RecordSink> = match config.output.backend {
        SinkBackend::Sqlite => Arc::new(SqliteSink::new(Arc::clone(&storage))),
        SinkBackend::D1 => {
            let d1 = D1Sink::new(client, D1Config::from_output(&config.output)?);
            d1.ensure_schema()
                .await
                .map_err(|e| CrawlError::SinkUnavailable(e.to_string()))?;
            Arc::new(d1)
        }
    };

    let store: Arc<Mutex<dyn RunStore + Send>> = storage;
    let mut session = CrawlSession::from_config(config, fetcher, sink)
        .with_cancellation(options.cancel)
        .with_checkpoints(store, options.config_hash, options.fresh);
    if let Some(progress) = options.progress {
        session = session.with_progress(progress);
    }

    session.run(query).await
}
