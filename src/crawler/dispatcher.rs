//! Bounded concurrent record processing
//!
//! Every dispatched record first passes the session's [`Deduplicator`].
//! New records are handed to a [`RecordProcessor`] on their own tokio task;
//! each task holds a semaphore permit, so at most `concurrency` records are
//! in flight at once.

use crate::crawler::dedup::Deduplicator;
use crate::storage::Record;
use crate::{ConfigError, CrawlError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Why one record could not be processed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ItemError {
    /// Counted as a failed record; the batch continues
    #[error("{0}")]
    Failed(String),

    /// The sink cannot take more writes; the batch is aborted
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Per-record work: optional detail fetch, extraction, upsert
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    async fn process(&self, record: Record) -> Result<(), ItemError>;
}

/// Adapts a plain async closure to [`RecordProcessor`]
struct FnProcessor<F>(F);

#[async_trait]
impl<F, Fut> RecordProcessor for FnProcessor<F>
where
    F: Fn(Record) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ItemError>> + Send,
{
    async fn process(&self, record: Record) -> Result<(), ItemError> {
        (self.0)(record).await
    }
}

/// Dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Records handed to the processor
    pub dispatched: u64,
    pub records_written: u64,
    pub records_skipped_duplicate: u64,
    pub records_failed: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    written: AtomicU64,
    skipped_duplicate: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.dispatched.load(Ordering::SeqCst),
            records_written: self.written.load(Ordering::SeqCst),
            records_skipped_duplicate: self.skipped_duplicate.load(Ordering::SeqCst),
            records_failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// Runs records through a processor with bounded concurrency
pub struct ConcurrentDispatcher {
    processor: Arc<dyn RecordProcessor>,
    dedup: Arc<Deduplicator>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    tasks: JoinSet<()>,
    counters: Arc<Counters>,
    aborted: Arc<AtomicBool>,
    fatal_error: Arc<Mutex<Option<String>>>,
    cancel: CancellationToken,
}

impl ConcurrentDispatcher {
    /// Creates a dispatcher
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `concurrency` is zero.
    pub fn new(
        processor: Arc<dyn RecordProcessor>,
        dedup: Arc<Deduplicator>,
        concurrency: usize,
    ) -> Result<Self, CrawlError> {
        if concurrency == 0 {
            return Err(ConfigError::Validation("concurrency must be at least 1".to_string()).into());
        }

        Ok(Self {
            processor,
            dedup,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            tasks: JoinSet::new(),
            counters: Arc::new(Counters::default()),
            aborted: Arc::new(AtomicBool::new(false)),
            fatal_error: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
        })
    }

    /// Stops taking records once `token` is cancelled, including while
    /// waiting for a free slot
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// True once a processor reported [`ItemError::Fatal`]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Message of the fatal error that aborted the batch
    pub fn fatal_error(&self) -> Option<String> {
        match self.fatal_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Current counters; in-flight records are not yet counted as written
    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// Deduplicates `record` and starts processing it
    ///
    /// Waits for a free slot when `concurrency` records are in flight.
    /// Returns false if the batch was aborted or cancelled and the record
    /// was not taken.
    pub async fn dispatch(&mut self, record: Record) -> bool {
        if self.is_aborted() || self.cancel.is_cancelled() {
            return false;
        }

        if !self.dedup.seen(&record.natural_key) {
            debug!("Duplicate key {}", record.natural_key);
            self.counters.skipped_duplicate.fetch_add(1, Ordering::SeqCst);
            return true;
        }

        let semaphore = Arc::clone(&self.semaphore);
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            permit = semaphore.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };
        self.reap_finished();

        // A fatal error may have landed while waiting for the permit
        if self.is_aborted() {
            return false;
        }

        self.counters.dispatched.fetch_add(1, Ordering::SeqCst);

        let processor = Arc::clone(&self.processor);
        let counters = Arc::clone(&self.counters);
        let aborted = Arc::clone(&self.aborted);
        let fatal_error = Arc::clone(&self.fatal_error);

        self.tasks.spawn(async move {
            let _permit = permit;
            let key = record.natural_key.clone();

            match processor.process(record).await {
                Ok(()) => {
                    counters.written.fetch_add(1, Ordering::SeqCst);
                }
                Err(ItemError::Failed(message)) => {
                    warn!("Record {} failed: {}", key, message);
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                }
                Err(ItemError::Fatal(message)) => {
                    error!("Record {} hit a fatal sink error: {}", key, message);
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                    if !aborted.swap(true, Ordering::SeqCst) {
                        let mut slot = match fatal_error.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        *slot = Some(message);
                    }
                }
            }
        });

        true
    }

    /// Waits for every in-flight record and returns the final counters
    pub async fn drain(&mut self) -> DispatchStats {
        while let Some(result) = self.tasks.join_next().await {
            self.count_join(result);
        }
        self.stats()
    }

    /// Collects tasks that already finished so the set does not grow
    fn reap_finished(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            self.count_join(result);
        }
    }

    fn count_join(&self, result: Result<(), tokio::task::JoinError>) {
        if let Err(e) = result {
            warn!("Record task ended abnormally: {}", e);
            self.counters.failed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Processes `items` with `worker`, at most `concurrency` at a time
///
/// Stops taking new items once a worker returns [`ItemError::Fatal`];
/// items already in flight still finish.
///
/// # Example
///
/// ```no_run
/// use archive_crawl::crawler::{run_dispatch, Deduplicator, ItemError};
/// use archive_crawl::{NormalizationPolicy, Record};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), archive_crawl::CrawlError> {
/// let dedup = Arc::new(Deduplicator::with_policy(NormalizationPolicy::StripQuery));
/// let items = vec![Record::new("a.com/x", "https://a.com/x")];
/// let stats = run_dispatch(items, dedup, |_record| async { Ok::<(), ItemError>(()) }, 10).await?;
/// assert_eq!(stats.records_written, 1);
/// # Ok(())
/// # }
/// ```
pub async fn run<I, F, Fut>(
    items: I,
    dedup: Arc<Deduplicator>,
    worker: F,
    concurrency: usize,
) -> Result<DispatchStats, CrawlError>
where
    I: IntoIterator<Item = Record>,
    F: Fn(Record) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ItemError>> + Send + 'static,
{
    let processor: Arc<dyn RecordProcessor> = Arc::new(FnProcessor(worker));
    let mut dispatcher = ConcurrentDispatcher::new(processor, dedup, concurrency)?;

    for item in items {
        if !dispatcher.dispatch(item).await {
            break;
        }
    }

    Ok(dispatcher.drain().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::NormalizationPolicy;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                let url = format!("https://a.com/{}", i);
                Record::new(url.clone(), url)
            })
            .collect()
    }

    fn dedup() -> Arc<Deduplicator> {
        Arc::new(Deduplicator::with_policy(NormalizationPolicy::StripQuery))
    }

    /// Tracks how many workers run at once
    #[derive(Default)]
    struct InFlight {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    async fn tracked_run(concurrency: usize, items: usize) -> (DispatchStats, usize) {
        let gauge = Arc::new(InFlight::default());
        let worker_gauge = Arc::clone(&gauge);

        let stats = run(
            records(items),
            dedup(),
            move |_record| {
                let gauge = Arc::clone(&worker_gauge);
                async move {
                    let now = gauge.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    gauge.max_in_flight.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    gauge.in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), ItemError>(())
                }
            },
            concurrency,
        )
        .await
        .unwrap();

        (stats, gauge.max_in_flight.load(Ordering::SeqCst))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        for concurrency in [1, 10, 100] {
            let (stats, max) = tracked_run(concurrency, 300).await;
            assert_eq!(stats.records_written, 300);
            assert!(max <= concurrency, "{} in flight with limit {}", max, concurrency);
            assert_eq!(max, concurrency);
        }
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_rejected() {
        let result = run(records(1), dedup(), |_r| async { Ok::<(), ItemError>(()) }, 0).await;
        assert!(matches!(result, Err(CrawlError::Config(_))));
    }

    #[tokio::test]
    async fn test_duplicates_are_skipped() {
        let mut items = records(3);
        items.push(Record::new("https://a.com/1?utm=x", "https://a.com/1?utm=x"));
        items.push(Record::new("https://a.com/1", "https://a.com/1"));

        let stats = run(items, dedup(), |_r| async { Ok::<(), ItemError>(()) }, 4).await.unwrap();

        assert_eq!(stats.records_written, 3);
        assert_eq!(stats.records_skipped_duplicate, 2);
        assert_eq!(stats.dispatched, 3);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let stats = run(
            records(10),
            dedup(),
            |record| async move {
                if record.url.ends_with('3') || record.url.ends_with('7') {
                    Err(ItemError::Failed("boom".to_string()))
                } else {
                    Ok(())
                }
            },
            3,
        )
        .await
        .unwrap();

        assert_eq!(stats.records_written, 8);
        assert_eq!(stats.records_failed, 2);
    }

    #[tokio::test]
    async fn test_panicking_worker_counts_as_failed() {
        let stats = run(
            records(4),
            dedup(),
            |record| async move {
                if record.url.ends_with('2') {
                    panic!("worker bug");
                }
                Ok::<(), ItemError>(())
            },
            2,
        )
        .await
        .unwrap();

        assert_eq!(stats.records_written, 3);
        assert_eq!(stats.records_failed, 1);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_batch() {
        let processor: Arc<dyn RecordProcessor> = Arc::new(FnProcessor(|_r: Record| async {
            Err(ItemError::Fatal("no such table: records".to_string()))
        }));
        let mut dispatcher = ConcurrentDispatcher::new(processor, dedup(), 1).unwrap();

        let mut taken = 0;
        for record in records(10) {
            if !dispatcher.dispatch(record).await {
                break;
            }
            taken += 1;
        }
        let stats = dispatcher.drain().await;

        assert!(dispatcher.is_aborted());
        assert!(taken < 10);
        assert_eq!(stats.records_written, 0);
        assert_eq!(stats.records_failed, stats.dispatched);
        assert_eq!(
            dispatcher.fatal_error().as_deref(),
            Some("no such table: records")
        );
        assert!(!dispatcher.dispatch(Record::new("x.com", "https://x.com")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_for_slot() {
        let started = Arc::new(AtomicUsize::new(0));
        let worker_started = Arc::clone(&started);
        let processor: Arc<dyn RecordProcessor> = Arc::new(FnProcessor(move |_r: Record| {
            let started = Arc::clone(&worker_started);
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<(), ItemError>(())
            }
        }));
        let token = CancellationToken::new();
        let mut dispatcher = ConcurrentDispatcher::new(processor, dedup(), 1)
            .unwrap()
            .with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let mut taken = 0;
        for record in records(4) {
            if !dispatcher.dispatch(record).await {
                break;
            }
            taken += 1;
        }
        let stats = dispatcher.drain().await;
        canceller.await.unwrap();

        assert_eq!(taken, 1);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.records_written, 1);
    }
}
