//! Index query construction
//!
//! An [`IndexQuery`] is built once per session from the `[source]` config
//! and turned into one request URL per cursor.

use crate::config::{SourceConfig, SourceKind};
use crate::url::strip_scheme;
use crate::CrawlError;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Most sitemap documents a single session will fetch
pub const MAX_SITEMAPS: usize = 100;

/// Body format of an index page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    /// CDX `output=json`: header row, data rows, optional resume key
    CdxJson,
    /// CDX plain text, whitespace separated
    CdxText,
    /// Common Crawl index, one JSON object per line
    CcIndex,
    /// `<urlset>` or `<sitemapindex>` XML
    Sitemap,
}

impl IndexFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CdxJson => "cdx-json",
            Self::CdxText => "cdx-text",
            Self::CcIndex => "cc-index",
            Self::Sitemap => "sitemap",
        }
    }
}

impl fmt::Display for IndexFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How successive pages are requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pagination {
    /// Follow a server-supplied cursor (a resume key, or a child sitemap)
    Cursor,
    /// One request returns everything
    SingleShot,
}

/// CDX `matchType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MatchType {
    #[default]
    Prefix,
    Exact,
    Host,
    Domain,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prefix => "prefix",
            Self::Exact => "exact",
            Self::Host => "host",
            Self::Domain => "domain",
        }
    }
}

impl FromStr for MatchType {
    type Err = CrawlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prefix" => Ok(Self::Prefix),
            "exact" => Ok(Self::Exact),
            "host" => Ok(Self::Host),
            "domain" => Ok(Self::Domain),
            other => Err(CrawlError::InvalidQuery(format!(
                "unknown match type '{}'",
                other
            ))),
        }
    }
}

/// Immutable description of what a session reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexQuery {
    /// Index endpoint, or the root sitemap URL
    pub base_url: String,
    /// URL pattern handed to the index
    pub domain_filter: String,
    /// `from` timestamp (YYYYMMDD or YYYYMMDDhhmmss)
    pub start_time: Option<String>,
    /// `to` timestamp
    pub end_time: Option<String>,
    pub page_size: u32,
    /// Entries whose status differs from this string are dropped
    pub status_filter: Option<String>,
    pub match_type: MatchType,
    pub collapse: Option<String>,
    /// Sent as `filter=!statuscode:NNN`
    pub exclude_status: Option<String>,
    pub pagination: Pagination,
    pub format: IndexFormat,
    /// Cursor for the first request
    pub resume_key: Option<String>,
    /// Child sitemaps are followed only if their URL contains this text
    pub sitemap_filter: Option<String>,
}

impl IndexQuery {
    /// Creates a query with the usual CDX defaults
    ///
    /// Cursor pagination is used for `CdxJson` and `Sitemap`, single-shot
    /// for the other formats.
    pub fn new(
        base_url: impl Into<String>,
        domain_filter: impl Into<String>,
        format: IndexFormat,
    ) -> Self {
        let pagination = match format {
            IndexFormat::CdxJson | IndexFormat::Sitemap => Pagination::Cursor,
            IndexFormat::CdxText | IndexFormat::CcIndex => Pagination::SingleShot,
        };

        Self {
            base_url: base_url.into(),
            domain_filter: domain_filter.into(),
            start_time: None,
            end_time: None,
            page_size: 1000,
            status_filter: Some("200".to_string()),
            match_type: MatchType::Prefix,
            collapse: Some("urlkey".to_string()),
            exclude_status: Some("404".to_string()),
            pagination,
            format,
            resume_key: None,
            sitemap_filter: None,
        }
    }

    /// Builds the query for a `[source]` section
    pub fn from_source(source: &SourceConfig) -> Result<Self, CrawlError> {
        let format = match source.kind {
            SourceKind::Cdx => IndexFormat::CdxJson,
            SourceKind::CdxText => IndexFormat::CdxText,
            SourceKind::CcIndex => IndexFormat::CcIndex,
            SourceKind::Sitemap => IndexFormat::Sitemap,
        };

        let base_url = source
            .base_url
            .clone()
            .or_else(|| source.kind.default_base_url().map(str::to_string))
            .ok_or_else(|| CrawlError::InvalidQuery("base_url is required".to_string()))?;

        let query = Self {
            start_time: source.start_date.clone(),
            end_time: source.end_date.clone(),
            page_size: source.page_size,
            status_filter: non_empty(&source.status_filter),
            match_type: source.match_type.parse()?,
            collapse: non_empty(&source.collapse),
            exclude_status: non_empty(&source.exclude_status),
            resume_key: non_empty(&source.resume_key),
            sitemap_filter: non_empty(&source.sitemap_filter),
            ..Self::new(base_url, strip_scheme(source.domain.trim()), format)
        };

        query.validate()?;
        Ok(query)
    }

    pub fn with_dates(mut self, start: Option<&str>, end: Option<&str>) -> Self {
        self.start_time = start.map(str::to_string);
        self.end_time = end.map(str::to_string);
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_status_filter(mut self, status: Option<&str>) -> Self {
        self.status_filter = status.map(str::to_string);
        self
    }

    pub fn with_exclude_status(mut self, status: Option<&str>) -> Self {
        self.exclude_status = status.map(str::to_string);
        self
    }

    pub fn with_collapse(mut self, collapse: Option<&str>) -> Self {
        self.collapse = collapse.map(str::to_string);
        self
    }

    pub fn with_match_type(mut self, match_type: MatchType) -> Self {
        self.match_type = match_type;
        self
    }

    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn with_resume_key(mut self, resume_key: Option<&str>) -> Self {
        self.resume_key = resume_key.filter(|k| !k.is_empty()).map(str::to_string);
        self
    }

    pub fn with_sitemap_filter(mut self, filter: Option<&str>) -> Self {
        self.sitemap_filter = filter.map(str::to_string);
        self
    }

    /// Checks the query before a session starts
    pub fn validate(&self) -> Result<(), CrawlError> {
        let invalid = |msg: String| -> Result<(), CrawlError> { Err(CrawlError::InvalidQuery(msg)) };

        let base = Url::parse(&self.base_url).map_err(|e| {
            CrawlError::InvalidQuery(format!("base_url '{}': {}", self.base_url, e))
        })?;
        if base.scheme() != "http" && base.scheme() != "https" {
            return invalid(format!("base_url must be http(s), got '{}'", self.base_url));
        }

        if self.format != IndexFormat::Sitemap && self.domain_filter.trim().is_empty() {
            return invalid("domain filter cannot be empty".to_string());
        }

        if self.page_size < 1 {
            return invalid("page_size must be >= 1".to_string());
        }

        for time in [&self.start_time, &self.end_time].into_iter().flatten() {
            if (time.len() != 8 && time.len() != 14) || !time.chars().all(|c| c.is_ascii_digit())
            {
                return invalid(format!("timestamp '{}' must be 8 or 14 digits", time));
            }
        }
        if let (Some(start), Some(end)) = (&self.start_time, &self.end_time) {
            let n = start.len().min(end.len());
            if start[..n] > end[..n] {
                return invalid(format!("start {} is after end {}", start, end));
            }
        }

        let cursor_capable = matches!(self.format, IndexFormat::CdxJson | IndexFormat::Sitemap);
        if self.pagination == Pagination::Cursor && !cursor_capable {
            return invalid(format!("{} does not support cursor pagination", self.format));
        }

        Ok(())
    }

    /// Request URL for the page at `cursor` (`None` for the first page)
    pub fn page_url(&self, cursor: Option<&str>) -> Result<String, CrawlError> {
        let cursor = cursor.filter(|c| !c.is_empty());

        if self.format == IndexFormat::Sitemap {
            return Ok(cursor.unwrap_or(&self.base_url).to_string());
        }

        let mut url = Url::parse(&self.base_url)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("url", &self.domain_filter);
            pairs.append_pair("matchType", self.match_type.as_str());

            if self.format != IndexFormat::CcIndex {
                if let Some(collapse) = &self.collapse {
                    pairs.append_pair("collapse", collapse);
                }
                if let Some(status) = &self.exclude_status {
                    pairs.append_pair("filter", &format!("!statuscode:{}", status));
                }
            }

            if let Some(start) = &self.start_time {
                pairs.append_pair("from", start);
            }
            if let Some(end) = &self.end_time {
                pairs.append_pair("to", end);
            }

            match self.format {
                IndexFormat::CdxText => {
                    pairs.append_pair("fl", "timestamp,original");
                }
                IndexFormat::CdxJson | IndexFormat::CcIndex => {
                    pairs.append_pair("output", "json");
                }
                IndexFormat::Sitemap => {}
            }

            if self.pagination == Pagination::Cursor {
                pairs.append_pair("limit", &self.page_size.to_string());
                pairs.append_pair("showResumeKey", "true");
                if let Some(cursor) = cursor {
                    pairs.append_pair("resumeKey", cursor);
                }
            }
        }

        Ok(url.into())
    }

    /// Stable identity of this query, used to find resumable runs
    ///
    /// SHA-256 of the first-page URL; the starting cursor is not part of it.
    pub fn fingerprint(&self) -> Result<String, CrawlError> {
        let mut hasher = Sha256::new();
        hasher.update(self.page_url(None)?.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// Whether a checkpoint cursor alone is enough to resume this query
    pub fn supports_resume(&self) -> bool {
        self.format == IndexFormat::CdxJson && self.pagination == Pagination::Cursor
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_pairs(url: &str) -> Vec<(String, String)> {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    fn pair<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn cdx() -> IndexQuery {
        IndexQuery::new(
            "https://web.archive.org/cdx/search/cdx",
            "factly.in/",
            IndexFormat::CdxJson,
        )
        .with_dates(Some("20190101"), Some("20231231"))
    }

    #[test]
    fn test_cdx_json_wire_contract() {
        let url = cdx().page_url(None).unwrap();
        let pairs = query_pairs(&url);

        assert_eq!(pair(&pairs, "url"), Some("factly.in/"));
        assert_eq!(pair(&pairs, "matchType"), Some("prefix"));
        assert_eq!(pair(&pairs, "collapse"), Some("urlkey"));
        assert_eq!(pair(&pairs, "filter"), Some("!statuscode:404"));
        assert_eq!(pair(&pairs, "from"), Some("20190101"));
        assert_eq!(pair(&pairs, "to"), Some("20231231"));
        assert_eq!(pair(&pairs, "limit"), Some("1000"));
        assert_eq!(pair(&pairs, "output"), Some("json"));
        assert_eq!(pair(&pairs, "showResumeKey"), Some("true"));
        assert_eq!(pair(&pairs, "resumeKey"), None);
    }

    #[test]
    fn test_cursor_is_sent_as_resume_key() {
        let url = cdx().page_url(Some("com,factly)/a+20200101")).unwrap();
        let pairs = query_pairs(&url);
        assert_eq!(pair(&pairs, "resumeKey"), Some("com,factly)/a+20200101"));

        let url = cdx().page_url(Some("")).unwrap();
        assert_eq!(pair(&query_pairs(&url), "resumeKey"), None);
    }

    #[test]
    fn test_cdx_text_is_single_shot() {
        let query = IndexQuery::new(
            "http://web.archive.org/cdx/search/cdx",
            "tiktok.com/tag/",
            IndexFormat::CdxText,
        );
        assert_eq!(query.pagination, Pagination::SingleShot);

        let pairs = query_pairs(&query.page_url(None).unwrap());
        assert_eq!(pair(&pairs, "fl"), Some("timestamp,original"));
        assert_eq!(pair(&pairs, "output"), None);
        assert_eq!(pair(&pairs, "limit"), None);
    }

    #[test]
    fn test_cc_index_url() {
        let query = IndexQuery::new(
            "https://index.commoncrawl.org/CC-MAIN-2024-40-index",
            "instagram.com/explore/tags/*",
            IndexFormat::CcIndex,
        );
        let pairs = query_pairs(&query.page_url(None).unwrap());
        assert_eq!(pair(&pairs, "url"), Some("instagram.com/explore/tags/*"));
        assert_eq!(pair(&pairs, "output"), Some("json"));
        assert_eq!(pair(&pairs, "collapse"), None);
    }

    #[test]
    fn test_sitemap_cursor_is_the_document_url() {
        let query = IndexQuery::new("https://a.com/sitemap.xml", "", IndexFormat::Sitemap);
        assert_eq!(query.page_url(None).unwrap(), "https://a.com/sitemap.xml");
        assert_eq!(
            query.page_url(Some("https://a.com/sitemap-2.xml")).unwrap(),
            "https://a.com/sitemap-2.xml"
        );
        assert!(query.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_queries() {
        assert!(cdx().validate().is_ok());

        let bad_base = IndexQuery::new("not a url", "a.com", IndexFormat::CdxJson);
        assert!(matches!(bad_base.validate(), Err(CrawlError::InvalidQuery(_))));

        let no_domain = IndexQuery::new("https://x.org/cdx", " ", IndexFormat::CdxJson);
        assert!(no_domain.validate().is_err());

        assert!(cdx().with_page_size(0).validate().is_err());
        assert!(cdx()
            .with_dates(Some("20240101"), Some("20230101"))
            .validate()
            .is_err());
        assert!(cdx().with_dates(Some("2024"), None).validate().is_err());

        let cursor_text = IndexQuery::new("https://x.org/cdx", "a.com", IndexFormat::CdxText)
            .with_pagination(Pagination::Cursor);
        assert!(cursor_text.validate().is_err());
    }

    #[test]
    fn test_fingerprint_ignores_resume_key() {
        let plain = cdx();
        let resumed = cdx().with_resume_key(Some("abc"));
        assert_eq!(plain.fingerprint().unwrap(), resumed.fingerprint().unwrap());

        let other = cdx().with_dates(Some("20200101"), None);
        assert_ne!(plain.fingerprint().unwrap(), other.fingerprint().unwrap());
        assert_eq!(plain.fingerprint().unwrap().len(), 64);
    }

    #[test]
    fn test_match_type_parse() {
        assert_eq!("host".parse::<MatchType>().unwrap(), MatchType::Host);
        assert!("fuzzy".parse::<MatchType>().is_err());
    }

    #[test]
    fn test_supports_resume() {
        assert!(cdx().supports_resume());
        assert!(!IndexQuery::new("https://a.com/s.xml", "", IndexFormat::Sitemap).supports_resume());
    }
}
