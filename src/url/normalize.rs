use crate::{UrlError, UrlResult};
use url::form_urlencoded;
use url::Url;

/// List of tracking query parameters to remove during canonicalization
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
    "mc_eid",
    "ref",
    "source",
];

/// Parses a capture URL, accepting the scheme-less form index APIs often use
///
/// `a.com/x` is read as `http://a.com/x`. Only HTTP and HTTPS are accepted.
pub fn parse_lenient(raw: &str) -> UrlResult<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }

    let url = if trimmed.contains("://") {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("http://{}", trimmed))
    }
    .map_err(|e| UrlError::Parse(e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::InvalidScheme(url.scheme().to_string()));
    }

    Ok(url)
}

/// Key that ignores scheme, `www.`, query string, fragment and trailing slash
///
/// This is the rule for Wayback `original` URLs, where the same page is
/// captured under many tracking-parameter variants.
///
/// # Examples
///
/// ```
/// use archive_crawl::url::strip_query_key;
///
/// assert_eq!(strip_query_key("a.com/x?utm=1").unwrap(), "a.com/x");
/// assert_eq!(strip_query_key("https://www.A.com/x/").unwrap(), "a.com/x");
/// ```
pub fn strip_query_key(raw: &str) -> UrlResult<String> {
    let url = parse_lenient(raw)?;
    let host = host_key(&url)?;
    let path = normalize_path(url.path());

    if path == "/" {
        Ok(host)
    } else {
        Ok(format!("{}{}", host, path))
    }
}

/// Key that keeps meaningful query parameters
///
/// # Normalization Steps
///
/// 1. Parse the URL (scheme optional)
/// 2. Lowercase the host and drop the `www.` prefix
/// 3. Remove dot segments and the trailing slash
/// 4. Remove the fragment
/// 5. Remove tracking query parameters
/// 6. Sort the remaining query parameters by name
pub fn canonical_key(raw: &str) -> UrlResult<String> {
    let url = parse_lenient(raw)?;
    let mut key = strip_query_key(url.as_str())?;

    if url.query().is_some() {
        let params = filter_and_sort_query_params(&url);
        if !params.is_empty() {
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            for (k, v) in &params {
                serializer.append_pair(k, v);
            }
            key.push('?');
            key.push_str(&serializer.finish());
        }
    }

    Ok(key)
}

/// Key for hashtag pages: the tag text itself
///
/// The tag is the last non-empty path segment of a URL such as
/// `https://www.tiktok.com/tag/Cats?lang=en`, or the whole input when it
/// is already a bare tag. Percent-encoding is decoded, the text is
/// lowercased, and everything except letters, digits and `_` is dropped
/// (this removes `#` and emoji).
pub fn hashtag_key(raw: &str) -> UrlResult<String> {
    let trimmed = raw.trim();
    let segment = if trimmed.contains('/') {
        let url = parse_lenient(trimmed)?;
        url.path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(str::to_string)
            .ok_or(UrlError::Empty)?
    } else {
        trimmed.split(['?', '&']).next().unwrap_or("").to_string()
    };

    let decoded = urlencoding::decode(&segment)
        .map(|cow| cow.into_owned())
        .unwrap_or(segment);

    let tag: String = decoded
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect();

    if tag.is_empty() {
        Err(UrlError::Empty)
    } else {
        Ok(tag)
    }
}

/// Key that is the trimmed input
pub fn exact_key(raw: &str) -> UrlResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        Err(UrlError::Empty)
    } else {
        Ok(trimmed.to_string())
    }
}

/// Lowercased host without `www.`, with a non-default port appended
fn host_key(url: &Url) -> UrlResult<String> {
    let host = url.host_str().ok_or(UrlError::MissingDomain)?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if host.is_empty() {
        return Err(UrlError::MissingDomain);
    }

    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

/// Normalizes a URL path by removing dot segments and trailing slashes
fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            // Skip empty segments (from multiple slashes) and current directory markers
            "" | "." => continue,
            ".." => {
                normalized_segments.pop();
            }
            _ => normalized_segments.push(segment),
        }
    }

    if normalized_segments.is_empty() {
        return "/".to_string();
    }

    format!("/{}", normalized_segments.join("/"))
}

/// Filters out tracking parameters and sorts remaining query parameters
fn filter_and_sort_query_params(url: &Url) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    params.sort();
    params
}

/// Checks if a query parameter is a tracking parameter
fn is_tracking_param(key: &str) -> bool {
    TRACKING_PARAMS.contains(&key) || key.starts_with("utm_")
}
