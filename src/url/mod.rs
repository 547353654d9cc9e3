//! URL handling module
//!
//! Natural-key normalization for deduplication. Each data source has its own
//! rule (Wayback `original` URLs, Common Crawl URLs, hashtag pages), so the
//! rule is chosen per session through [`NormalizationPolicy`] or supplied as a
//! custom [`Normalizer`].

mod normalize;

use crate::UrlResult;
use serde::Deserialize;
use std::sync::Arc;

pub use normalize::{canonical_key, exact_key, hashtag_key, parse_lenient, strip_query_key};

/// A natural-key normalization function
///
/// Implementations must be idempotent: normalizing an already-normalized key
/// returns it unchanged.
pub type Normalizer = Arc<dyn Fn(&str) -> UrlResult<String> + Send + Sync>;

/// Built-in normalization rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NormalizationPolicy {
    /// Host and path only; see [`strip_query_key`]
    #[default]
    StripQuery,
    /// Host, path and non-tracking query parameters; see [`canonical_key`]
    Canonical,
    /// Tag text; see [`hashtag_key`]
    Hashtag,
    /// Trimmed input; see [`exact_key`]
    Exact,
}

impl NormalizationPolicy {
    /// Applies this rule to a raw key
    pub fn normalize(&self, raw: &str) -> UrlResult<String> {
        match self {
            Self::StripQuery => strip_query_key(raw),
            Self::Canonical => canonical_key(raw),
            Self::Hashtag => hashtag_key(raw),
            Self::Exact => exact_key(raw),
        }
    }

    /// Returns this rule as a shareable [`Normalizer`]
    pub fn normalizer(self) -> Normalizer {
        Arc::new(move |raw: &str| self.normalize(raw))
    }

    /// Whether records produced under this rule carry a hashtag
    pub fn produces_tags(&self) -> bool {
        matches!(self, Self::Hashtag)
    }
}

/// Removes a leading `http://` or `https://` from a domain setting
///
/// # Examples
///
/// ```
/// use archive_crawl::url::strip_scheme;
///
/// assert_eq!(strip_scheme("https://factly.in/"), "factly.in/");
/// assert_eq!(strip_scheme("factly.in/"), "factly.in/");
/// ```
pub fn strip_scheme(domain: &str) -> &str {
    domain
        .strip_prefix("https://")
        .or_else(|| domain.strip_prefix("http://"))
        .unwrap_or(domain)
}
