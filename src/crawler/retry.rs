//! Bounded retries with exponential backoff
//!
//! Every attempt goes through the session's [`RateLimiter`]. Retriable
//! failures sleep `base * 2^attempt` (capped at the ceiling) before the next
//! attempt; permanent failures return at once.

use crate::config::CrawlerConfig;
use crate::crawler::fetcher::{
    classify_response, FailureKind, FetchFailure, FetchResult, PageFetcher,
};
use crate::crawler::rate_limiter::RateLimiter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Exponential backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub ceiling: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, ceiling: Duration, max_retries: u32) -> Self {
        Self {
            base,
            ceiling,
            max_retries,
        }
    }

    /// Request retry policy from the crawler config
    pub fn for_requests(config: &CrawlerConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
            config.retry_count,
        )
    }

    /// Sink retry policy: same schedule, `sink-retries` budget
    pub fn for_sink(config: &CrawlerConfig) -> Self {
        Self {
            max_retries: config.sink_retries,
            ..Self::for_requests(config)
        }
    }

    /// Delay before retry number `attempt + 1`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
    }

    /// Every delay the policy can produce, in order
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(move |attempt| self.delay_for(attempt))
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(60), 5)
    }
}

/// GET with rate limiting, classification and bounded retries
#[derive(Clone)]
pub struct RetryingFetcher {
    fetcher: Arc<dyn PageFetcher>,
    limiter: Arc<RateLimiter>,
    policy: BackoffPolicy,
    headers: Vec<(String, String)>,
}

impl RetryingFetcher {
    pub fn new(fetcher: Arc<dyn PageFetcher>, limiter: Arc<RateLimiter>, policy: BackoffPolicy) -> Self {
        Self {
            fetcher,
            limiter,
            policy,
            headers: Vec::new(),
        }
    }

    /// Adds a header sent with every request
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Fetches `url`, retrying retriable failures
    ///
    /// Returns the first success, the first permanent failure, or the last
    /// retriable failure once the retry budget is spent.
    pub async fn fetch(&self, url: &str, timeout: Duration) -> FetchResult {
        if let Err(e) = Url::parse(url) {
            return FetchResult::Failure(FetchFailure::new(
                FailureKind::InvalidUrl,
                None,
                format!("{}: {}", url, e),
            ));
        }

        if timeout.is_zero() {
            return FetchResult::Failure(FetchFailure::new(
                FailureKind::InvalidRequest,
                None,
                "timeout must be greater than zero",
            ));
        }

        let mut attempt: u32 = 0;
        loop {
            self.limiter.acquire().await;
            debug!("GET {} (attempt {})", url, attempt + 1);

            let result = match self.fetcher.fetch(url, &self.headers, timeout).await {
                Ok(response) => classify_response(response),
                Err(e) => FetchResult::Failure(FetchFailure::from(e)),
            };

            let failure = match result {
                FetchResult::Failure(failure) => failure,
                success => return success,
            };

            if !failure.retriable {
                debug!("Permanent failure for {}: {}", url, failure);
                return FetchResult::Failure(failure);
            }

            if attempt >= self.policy.max_retries {
                warn!(
                    "Giving up on {} after {} attempts: {}",
                    url,
                    attempt + 1,
                    failure
                );
                return FetchResult::Failure(failure);
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                "Retrying {} in {:?} after {} (attempt {}/{})",
                url,
                delay,
                failure,
                attempt + 1,
                self.policy.total_attempts()
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
