//! Cursor pager
//!
//! Walks a paginated index one page at a time. Each call to
//! [`CursorPager::next_page`] issues at most one successful index request
//! (sitemap indexes may need a few) and hands back the entries before the
//! following page is requested.
//!
//! ```text
//! Start ──► FetchingPage ──► HasCursor ──► FetchingPage ──► ...
//!                │                              │
//!                ├──► Exhausted (clean)         ├──► Exhausted
//!                └──► Error (fetch failed)      └──► Error
//! ```

use crate::crawler::fetcher::{FetchFailure, FetchResult};
use crate::crawler::parser::{parse_page, IndexEntry, ParsedPage};
use crate::crawler::query::{IndexFormat, IndexQuery, Pagination, MAX_SITEMAPS};
use crate::crawler::retry::RetryingFetcher;
use crate::state::{PagerState, TerminationReason};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One page of entries handed to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPage {
    pub entries: Vec<IndexEntry>,

    /// Cursor the page was requested with (`None` for the first page)
    pub cursor: Option<String>,

    /// Request URL of the page
    pub url: String,

    /// Rows dropped at the parse boundary
    pub rejected_rows: usize,
}

/// Pulls pages from an index until a terminal condition
pub struct CursorPager {
    query: IndexQuery,
    fetcher: RetryingFetcher,
    timeout: Duration,
    state: PagerState,
    cursor: Option<String>,
    termination: Option<TerminationReason>,
    last_failure: Option<FetchFailure>,
    pages_fetched: u64,
    requests: u64,

    // Sitemap traversal
    pending_sitemaps: VecDeque<String>,
    visited_sitemaps: HashSet<String>,
}

impl CursorPager {
    /// Creates a pager positioned at the query's resume key
    pub fn new(query: IndexQuery, fetcher: RetryingFetcher, timeout: Duration) -> Self {
        let cursor = query.resume_key.clone().filter(|k| !k.is_empty());
        let mut visited_sitemaps = HashSet::new();
        if query.format == IndexFormat::Sitemap {
            visited_sitemaps.insert(cursor.clone().unwrap_or_else(|| query.base_url.clone()));
        }

        Self {
            query,
            fetcher,
            timeout,
            state: PagerState::Start,
            cursor,
            termination: None,
            last_failure: None,
            pages_fetched: 0,
            requests: 0,
            pending_sitemaps: VecDeque::new(),
            visited_sitemaps,
        }
    }

    pub fn state(&self) -> PagerState {
        self.state
    }

    /// Why pagination ended, once the pager is terminal
    pub fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    /// Cursor the next request will use
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Pages that carried data rows
    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched
    }

    /// Successful index requests, including empty and rejected pages
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// The failure that moved the pager to `Error`
    pub fn last_failure(&self) -> Option<&FetchFailure> {
        self.last_failure.as_ref()
    }

    pub fn query(&self) -> &IndexQuery {
        &self.query
    }

    /// Fetches the next page
    ///
    /// Returns `None` once the pager is terminal; [`Self::termination`]
    /// then says why.
    pub async fn next_page(&mut self) -> Option<IndexPage> {
        loop {
            if self.state.is_terminal() {
                return None;
            }

            self.state = PagerState::FetchingPage;
            let cursor = self.cursor.clone();

            let url = match self.query.page_url(cursor.as_deref()) {
                Ok(url) => url,
                Err(e) => {
                    warn!("Cannot build index URL for cursor {:?}: {}", cursor, e);
                    self.finish(PagerState::Error, TerminationReason::FetchError);
                    return None;
                }
            };

            debug!("Fetching index page {}", url);
            let body = match self.fetcher.fetch(&url, self.timeout).await {
                FetchResult::Success { body, .. } => body,
                FetchResult::Failure(failure) => {
                    warn!("Index page {} failed: {}", url, failure);
                    self.last_failure = Some(failure);
                    self.finish(PagerState::Error, TerminationReason::FetchError);
                    return None;
                }
            };
            self.requests += 1;

            let parsed = match parse_page(
                self.query.format,
                &body,
                self.query.status_filter.as_deref(),
            ) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Protocol error on {}: {}; treating as end of data", url, e);
                    self.finish(PagerState::Exhausted, TerminationReason::ProtocolError);
                    return None;
                }
            };

            let page = match self.query.format {
                IndexFormat::Sitemap => self.advance_sitemap(cursor, url, parsed),
                _ => self.advance_cursor(cursor, url, parsed),
            };

            match page {
                Some(page) => return Some(page),
                // A sitemap document with nothing in it; try the next one
                None if !self.state.is_terminal() => continue,
                None => return None,
            }
        }
    }

    /// CDX and Common Crawl pagination
    fn advance_cursor(
        &mut self,
        cursor: Option<String>,
        url: String,
        parsed: ParsedPage,
    ) -> Option<IndexPage> {
        if parsed.data_rows == 0 {
            info!("Index exhausted at {}", url);
            self.finish(PagerState::Exhausted, TerminationReason::Exhausted);
            return None;
        }

        let next = match self.query.pagination {
            Pagination::Cursor => parsed.next_cursor,
            Pagination::SingleShot => None,
        };

        if next.is_some() && next == cursor {
            warn!(
                "Index returned the same resume key {:?} twice; stopping (no progress)",
                next
            );
            self.finish(PagerState::Exhausted, TerminationReason::NoProgress);
            return None;
        }

        self.pages_fetched += 1;
        match next {
            Some(next) => {
                self.cursor = Some(next);
                self.state = PagerState::HasCursor;
            }
            None => {
                self.cursor = None;
                self.finish(PagerState::Exhausted, TerminationReason::Exhausted);
            }
        }

        Some(IndexPage {
            entries: parsed.entries,
            cursor,
            url,
            rejected_rows: parsed.rejected_rows,
        })
    }

    /// Sitemap traversal: the cursor is the next pending document
    fn advance_sitemap(
        &mut self,
        cursor: Option<String>,
        url: String,
        parsed: ParsedPage,
    ) -> Option<IndexPage> {
        for child in parsed.child_sitemaps {
            if let Some(filter) = &self.query.sitemap_filter {
                if !child.contains(filter.as_str()) {
                    debug!("Skipping sitemap {} (filter '{}')", child, filter);
                    continue;
                }
            }
            if self.visited_sitemaps.len() >= MAX_SITEMAPS {
                warn!("Sitemap limit of {} reached; ignoring {}", MAX_SITEMAPS, child);
                break;
            }
            if self.visited_sitemaps.insert(child.clone()) {
                self.pending_sitemaps.push_back(child);
            }
        }

        self.cursor = self.pending_sitemaps.pop_front();
        match self.cursor {
            Some(_) => self.state = PagerState::HasCursor,
            None => self.finish(PagerState::Exhausted, TerminationReason::Exhausted),
        }

        if parsed.entries.is_empty() && parsed.rejected_rows == 0 {
            return None;
        }

        self.pages_fetched += 1;
        Some(IndexPage {
            entries: parsed.entries,
            cursor,
            url,
            rejected_rows: parsed.rejected_rows,
        })
    }

    fn finish(&mut self, state: PagerState, reason: TerminationReason) {
        self.state = state;
        self.termination = Some(reason);
    }
}
