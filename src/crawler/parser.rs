//! Index page parsers
//!
//! This module turns raw index bodies into validated [`IndexEntry`] rows:
//! - CDX JSON (header row, data rows, empty separator row, resume key row)
//! - CDX plain text (`timestamp original` or the full 7-column form)
//! - Common Crawl index NDJSON
//! - Sitemaps and sitemap indexes
//!
//! Rows without a URL are rejected here and never reach the session.

use crate::crawler::query::IndexFormat;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// One validated row from an index page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub url: String,
    pub timestamp: Option<String>,
    pub status_code: Option<u16>,
    pub mime_type: Option<String>,
    pub digest: Option<String>,
}

impl IndexEntry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timestamp: None,
            status_code: None,
            mime_type: None,
            digest: None,
        }
    }
}

/// Everything extracted from one index page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    /// Entries that passed validation and the status filter
    pub entries: Vec<IndexEntry>,

    /// Resume key for the next page, if the index sent one
    pub next_cursor: Option<String>,

    /// Child sitemap URLs (sitemap index documents only)
    pub child_sitemaps: Vec<String>,

    /// Data rows on the page before filtering
    pub data_rows: usize,

    /// Rows dropped because they had no URL
    pub rejected_rows: usize,
}

impl ParsedPage {
    /// True when the page carried no data and points nowhere
    pub fn is_empty(&self) -> bool {
        self.data_rows == 0 && self.next_cursor.is_none() && self.child_sitemaps.is_empty()
    }
}

/// A body that does not have the expected shape
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("header row has no '{0}' column")]
    MissingColumn(&'static str),

    #[error("document is neither a urlset nor a sitemapindex")]
    NotASitemap,
}

/// Parses a body according to `format`
///
/// # Arguments
///
/// * `format` - Body format of the index
/// * `body` - Raw response text
/// * `status_filter` - Keep only rows whose status equals this string
pub fn parse_page(
    format: IndexFormat,
    body: &str,
    status_filter: Option<&str>,
) -> Result<ParsedPage, ParseError> {
    match format {
        IndexFormat::CdxJson => parse_cdx_json(body, status_filter),
        IndexFormat::CdxText => Ok(parse_cdx_text(body, status_filter)),
        IndexFormat::CcIndex => parse_cc_index(body, status_filter),
        IndexFormat::Sitemap => parse_sitemap(body),
    }
}

/// Parses a CDX `output=json` page
///
/// Row 0 names the columns. With `showResumeKey=true` the data rows are
/// followed by an empty row and a one-element row holding the resume key.
/// Fewer than two rows means there is no data.
pub fn parse_cdx_json(body: &str, status_filter: Option<&str>) -> Result<ParsedPage, ParseError> {
    if body.trim().is_empty() {
        return Ok(ParsedPage::default());
    }

    let rows: Vec<Vec<Value>> =
        serde_json::from_str(body).map_err(|e| ParseError::Json(e.to_string()))?;

    let mut page = ParsedPage::default();
    if rows.len() < 2 {
        return Ok(page);
    }

    let header: Vec<String> = rows[0].iter().map(cell_to_string).collect();
    let column = |name: &str| header.iter().position(|h| h == name);
    let url_col = column("original").ok_or(ParseError::MissingColumn("original"))?;
    let timestamp_col = column("timestamp");
    let status_col = column("statuscode");
    let mime_col = column("mimetype");
    let digest_col = column("digest");

    let mut data = rows[1..].iter();
    while let Some(row) = data.next() {
        if row.is_empty() {
            // Separator; the row after it holds the resume key
            page.next_cursor = data
                .next()
                .and_then(|r| r.first())
                .map(cell_to_string)
                .filter(|key| !key.is_empty());
            break;
        }

        page.data_rows += 1;

        let get = |col: Option<usize>| {
            col.and_then(|c| row.get(c))
                .map(cell_to_string)
                .filter(|v| !v.is_empty() && v != "-")
        };

        let url = match get(Some(url_col)) {
            Some(url) => url,
            None => {
                page.rejected_rows += 1;
                continue;
            }
        };

        let status = get(status_col);
        if !status_matches(status.as_deref(), status_filter) {
            continue;
        }

        page.entries.push(IndexEntry {
            url,
            timestamp: get(timestamp_col),
            status_code: status.and_then(|s| s.parse().ok()),
            mime_type: get(mime_col),
            digest: get(digest_col),
        });
    }

    Ok(page)
}

/// Parses a CDX plain-text page
///
/// Lines are either `timestamp original` (`fl=timestamp,original`) or the
/// default `urlkey timestamp original mimetype statuscode digest length`.
pub fn parse_cdx_text(body: &str, status_filter: Option<&str>) -> ParsedPage {
    let mut page = ParsedPage::default();

    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        page.data_rows += 1;
        let fields: Vec<&str> = line.split_whitespace().collect();

        let entry = match fields.len() {
            0 | 1 => None,
            n if n >= 7 => Some(IndexEntry {
                url: fields[2].to_string(),
                timestamp: Some(fields[1].to_string()),
                status_code: fields[4].parse().ok(),
                mime_type: Some(fields[3].to_string()).filter(|m| m != "-"),
                digest: Some(fields[5].to_string()).filter(|d| d != "-"),
            }),
            _ => Some(IndexEntry {
                timestamp: Some(fields[0].to_string()),
                ..IndexEntry::new(fields[1])
            }),
        };

        match entry {
            Some(entry) => {
                let status = entry.status_code.map(|s| s.to_string());
                // Two-column lines carry no status and are kept
                if fields.len() < 7 || status_matches(status.as_deref(), status_filter) {
                    page.entries.push(entry);
                }
            }
            None => page.rejected_rows += 1,
        }
    }

    page
}

#[derive(Debug, Deserialize)]
struct CcLine {
    url: Option<String>,
    timestamp: Option<Value>,
    status: Option<Value>,
    mime: Option<String>,
    digest: Option<String>,
}

/// Parses a Common Crawl index page (one JSON object per line)
pub fn parse_cc_index(body: &str, status_filter: Option<&str>) -> Result<ParsedPage, ParseError> {
    let mut page = ParsedPage::default();

    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let record: CcLine =
            serde_json::from_str(line).map_err(|e| ParseError::Json(e.to_string()))?;
        page.data_rows += 1;

        let url = match record.url.filter(|u| !u.is_empty()) {
            Some(url) => url,
            None => {
                page.rejected_rows += 1;
                continue;
            }
        };

        let status = record.status.as_ref().map(cell_to_string);
        if !status_matches(status.as_deref(), status_filter) {
            continue;
        }

        page.entries.push(IndexEntry {
            url,
            timestamp: record.timestamp.as_ref().map(cell_to_string),
            status_code: status.and_then(|s| s.parse().ok()),
            mime_type: record.mime,
            digest: record.digest,
        });
    }

    Ok(page)
}

/// Parses a sitemap (`<urlset>`) or sitemap index (`<sitemapindex>`)
pub fn parse_sitemap(body: &str) -> Result<ParsedPage, ParseError> {
    let document = Html::parse_document(body);
    let mut page = ParsedPage::default();

    let index_locs = select_texts(&document, "sitemapindex sitemap loc");
    if !index_locs.is_empty() || has_element(&document, "sitemapindex") {
        page.data_rows = index_locs.len();
        page.child_sitemaps = index_locs;
        return Ok(page);
    }

    if !has_element(&document, "urlset") {
        return Err(ParseError::NotASitemap);
    }

    let url_selector = selector("urlset url");
    let loc_selector = selector("loc");
    let lastmod_selector = selector("lastmod");

    if let (Some(url_selector), Some(loc_selector)) = (url_selector, loc_selector) {
        for url in document.select(&url_selector) {
            page.data_rows += 1;
            let loc = url.select(&loc_selector).next().map(element_text);
            match loc.filter(|l| !l.is_empty()) {
                Some(loc) => {
                    let timestamp = lastmod_selector
                        .as_ref()
                        .and_then(|s| url.select(s).next())
                        .map(element_text)
                        .filter(|t| !t.is_empty());
                    page.entries.push(IndexEntry {
                        timestamp,
                        ..IndexEntry::new(loc)
                    });
                }
                None => page.rejected_rows += 1,
            }
        }
    }

    Ok(page)
}

/// Extracts the page title from an HTML document
///
/// Whitespace runs inside the title collapse to one space.
pub fn extract_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let title_selector = selector("title")?;

    document
        .select(&title_selector)
        .next()
        .map(element_text)
        .filter(|s| !s.is_empty())
}

/// Compares a row status to the filter as strings
fn status_matches(status: Option<&str>, filter: Option<&str>) -> bool {
    match filter {
        None => true,
        Some(wanted) => status == Some(wanted),
    }
}

fn cell_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn has_element(document: &Html, css: &str) -> bool {
    selector(css).map_or(false, |s| document.select(&s).next().is_some())
}

fn select_texts(document: &Html, css: &str) -> Vec<String> {
    match selector(css) {
        Some(s) => document
            .select(&s)
            .map(element_text)
            .filter(|t| !t.is_empty())
            .collect(),
        None => Vec::new(),
    }
}

fn element_text(element: scraper::ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
