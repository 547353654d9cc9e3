use crate::url::NormalizationPolicy;
use serde::Deserialize;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub crawler: CrawlerConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Crawler behavior configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CrawlerConfig {
    /// Maximum number of records processed at once
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Retries per request after the first attempt
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// First backoff delay (milliseconds); doubles per attempt
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff ceiling (milliseconds)
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Minimum time between any two outbound requests (milliseconds)
    #[serde(default = "default_sleep_between_pages_ms")]
    pub sleep_between_pages_ms: u64,

    /// Per-request timeout (seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Stop after this many index entries; 0 means no limit
    #[serde(default)]
    pub max_total_items: u64,

    /// Upsert retries per record on transient sink errors
    #[serde(default = "default_sink_retries")]
    pub sink_retries: u32,

    /// Fetch each record's page and store its title
    #[serde(default)]
    pub fetch_details: bool,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            retry_count: default_retry_count(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            sleep_between_pages_ms: default_sleep_between_pages_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            max_total_items: 0,
            sink_retries: default_sink_retries(),
            fetch_details: false,
        }
    }
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    /// Name of the crawler
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

impl UserAgentConfig {
    /// Format: CrawlerName/Version (+ContactURL; ContactEmail)
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

/// Which index a session reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Wayback Machine CDX JSON with resume keys
    Cdx,
    /// Wayback Machine CDX plain-text stream, one request
    CdxText,
    /// Common Crawl index NDJSON, one request
    CcIndex,
    /// Sitemap or sitemap index tree
    Sitemap,
}

impl SourceKind {
    /// Default index endpoint for this kind
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Self::Cdx | Self::CdxText => Some("https://web.archive.org/cdx/search/cdx"),
            Self::CcIndex => Some("https://index.commoncrawl.org/CC-MAIN-2024-40-index"),
            Self::Sitemap => None,
        }
    }
}

/// Index source configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SourceConfig {
    pub kind: SourceKind,

    /// Index endpoint; for sitemaps, the root sitemap URL
    pub base_url: Option<String>,

    /// URL pattern handed to the index (e.g. "factly.in/")
    #[serde(default)]
    pub domain: String,

    /// prefix | exact | host | domain
    #[serde(default = "default_match_type")]
    pub match_type: String,

    /// YYYYMMDD or YYYYMMDDhhmmss
    pub start_date: Option<String>,

    pub end_date: Option<String>,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Only entries with this status (compared as a string) are kept
    #[serde(default = "default_status_filter")]
    pub status_filter: Option<String>,

    /// Status excluded server-side with `filter=!statuscode:NNN`
    #[serde(default = "default_exclude_status")]
    pub exclude_status: Option<String>,

    #[serde(default = "default_collapse")]
    pub collapse: Option<String>,

    /// Cursor to start from, as printed by an earlier run
    pub resume_key: Option<String>,

    #[serde(default)]
    pub normalization: NormalizationPolicy,

    /// Child sitemaps are only followed when their URL contains this text
    pub sitemap_filter: Option<String>,
}

/// Where records are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SinkBackend {
    #[default]
    Sqlite,
    D1,
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    #[serde(default)]
    pub backend: SinkBackend,

    /// Path to the SQLite database (records and run checkpoints)
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Record table name
    #[serde(default = "default_table")]
    pub table: String,

    pub d1_account_id: Option<String>,

    pub d1_database_id: Option<String>,

    /// Environment variable holding the D1 API token
    #[serde(default = "default_d1_api_token_env")]
    pub d1_api_token_env: String,

    #[serde(default = "default_d1_api_base")]
    pub d1_api_base: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            backend: SinkBackend::Sqlite,
            database_path: default_database_path(),
            table: default_table(),
            d1_account_id: None,
            d1_database_id: None,
            d1_api_token_env: default_d1_api_token_env(),
            d1_api_base: default_d1_api_base(),
        }
    }
}

fn default_concurrency() -> u32 {
    10
}

fn default_retry_count() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_sleep_between_pages_ms() -> u64 {
    3_000
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_sink_retries() -> u32 {
    3
}

fn default_match_type() -> String {
    "prefix".to_string()
}

fn default_page_size() -> u32 {
    1000
}

fn default_status_filter() -> Option<String> {
    Some("200".to_string())
}

fn default_exclude_status() -> Option<String> {
    Some("404".to_string())
}

fn default_collapse() -> Option<String> {
    Some("urlkey".to_string())
}

fn default_database_path() -> String {
    "./archive.db".to_string()
}

fn default_table() -> String {
    "archive_records".to_string()
}

fn default_d1_api_token_env() -> String {
    "CLOUDFLARE_API_TOKEN".to_string()
}

fn default_d1_api_base() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}
