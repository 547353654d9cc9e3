//! Crawler module for index pagination and record processing
//!
//! This module contains the core crawling logic, including:
//! - HTTP fetching with rate limiting and bounded retries
//! - Index query construction and page parsing
//! - Cursor pagination with no-progress detection
//! - Deduplication and bounded concurrent record processing
//! - Overall session coordination

mod coordinator;
mod dedup;
mod dispatcher;
mod fetcher;
mod pager;
mod parser;
mod query;
mod rate_limiter;
mod retry;
mod worker;

pub use coordinator::{
    run_crawl, CrawlOptions, CrawlSession, ProgressCallback, SessionProgress, SessionSummary,
};
pub use dedup::Deduplicator;
pub use dispatcher::{
    run as run_dispatch, ConcurrentDispatcher, DispatchStats, ItemError, RecordProcessor,
};
pub use fetcher::{
    build_http_client, classify_response, FailureKind, FetchFailure, FetchResult, HttpFetcher,
    PageFetcher, RawResponse, TransportError,
};
pub use pager::{CursorPager, IndexPage};
pub use parser::{
    extract_title, parse_cc_index, parse_cdx_json, parse_cdx_text, parse_page, parse_sitemap,
    IndexEntry, ParseError, ParsedPage,
};
pub use query::{IndexFormat, IndexQuery, MatchType, Pagination, MAX_SITEMAPS};
pub use rate_limiter::RateLimiter;
pub use retry::{BackoffPolicy, RetryingFetcher};
pub use worker::SinkWriter;

use crate::config::Config;
use crate::CrawlError;

/// Runs a complete crawl operation
///
/// This is the main entry point for starting a crawl. It will:
/// 1. Build the index query from the `[source]` section
/// 2. Open the SQLite database and the configured record sink
/// 3. Resume the newest unfinished run for the same query, if any
/// 4. Page through the index, writing each new record once
///
/// # Arguments
///
/// * `config` - The crawler configuration
///
/// # Returns
///
/// * `Ok(SessionSummary)` - The session ran to a terminal condition
/// * `Err(CrawlError)` - Setup failed
pub async fn crawl(config: &Config) -> Result<SessionSummary, CrawlError> {
    run_crawl(config, CrawlOptions::default()).await
}
