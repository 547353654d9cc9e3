use crate::config::types::{
    Config, CrawlerConfig, OutputConfig, SinkBackend, SourceConfig, SourceKind, UserAgentConfig,
};
use crate::ConfigError;
use url::Url;

const MATCH_TYPES: &[&str] = &["prefix", "exact", "host", "domain"];

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_user_agent_config(&config.user_agent)?;
    validate_source_config(&config.source)?;
    validate_output_config(&config.output)?;
    Ok(())
}

/// Validates crawler configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.concurrency < 1 || config.concurrency > 100 {
        return Err(ConfigError::Validation(format!(
            "concurrency must be between 1 and 100, got {}",
            config.concurrency
        )));
    }

    if config.request_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "request_timeout_secs must be > 0".to_string(),
        ));
    }

    if config.backoff_base_ms > config.backoff_max_ms {
        return Err(ConfigError::Validation(format!(
            "backoff_base_ms ({}) must not exceed backoff_max_ms ({})",
            config.backoff_base_ms, config.backoff_max_ms
        )));
    }

    Ok(())
}

/// Validates user agent configuration
fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler_name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler_name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid contact_url: {}", e)))?;

    validate_email(&config.contact_email)?;

    Ok(())
}

/// Validates the index source
fn validate_source_config(config: &SourceConfig) -> Result<(), ConfigError> {
    let base_url = match (&config.base_url, config.kind.default_base_url()) {
        (Some(url), _) => url.as_str(),
        (None, Some(default)) => default,
        (None, None) => {
            return Err(ConfigError::Validation(
                "base_url is required for sitemap sources".to_string(),
            ))
        }
    };
    Url::parse(base_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid base_url '{}': {}", base_url, e)))?;

    if config.kind != SourceKind::Sitemap && config.domain.trim().is_empty() {
        return Err(ConfigError::Validation(
            "domain cannot be empty for index sources".to_string(),
        ));
    }

    if !MATCH_TYPES.contains(&config.match_type.as_str()) {
        return Err(ConfigError::Validation(format!(
            "match_type must be one of {:?}, got '{}'",
            MATCH_TYPES, config.match_type
        )));
    }

    if config.page_size < 1 {
        return Err(ConfigError::Validation(
            "page_size must be >= 1".to_string(),
        ));
    }

    if let Some(start) = &config.start_date {
        validate_timestamp("start_date", start)?;
    }
    if let Some(end) = &config.end_date {
        validate_timestamp("end_date", end)?;
    }
    if let (Some(start), Some(end)) = (&config.start_date, &config.end_date) {
        let n = start.len().min(end.len());
        if start[..n] > end[..n] {
            return Err(ConfigError::Validation(format!(
                "start_date ({}) is after end_date ({})",
                start, end
            )));
        }
    }

    for (name, status) in [
        ("status_filter", &config.status_filter),
        ("exclude_status", &config.exclude_status),
    ] {
        if let Some(status) = status {
            if status.len() != 3 || !status.chars().all(|c| c.is_ascii_digit()) {
                return Err(ConfigError::Validation(format!(
                    "{} must be a three-digit status code, got '{}'",
                    name, status
                )));
            }
        }
    }

    Ok(())
}

/// Validates a CDX timestamp: YYYYMMDD or YYYYMMDDhhmmss
fn validate_timestamp(name: &str, value: &str) -> Result<(), ConfigError> {
    if (value.len() != 8 && value.len() != 14) || !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(ConfigError::Validation(format!(
            "{} must be 8 or 14 digits, got '{}'",
            name, value
        )));
    }
    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    validate_identifier(&config.table)?;

    if config.backend == SinkBackend::D1 {
        for (name, value) in [
            ("d1_account_id", &config.d1_account_id),
            ("d1_database_id", &config.d1_database_id),
        ] {
            if value.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::Validation(format!(
                    "{} is required for the d1 backend",
                    name
                )));
            }
        }

        Url::parse(&config.d1_api_base)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid d1_api_base: {}", e)))?;
    }

    Ok(())
}

/// Table names are interpolated into SQL, so only plain identifiers pass
fn validate_identifier(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!(
            "table must be a plain SQL identifier, got '{}'",
            name
        )))
    }
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    if email.is_empty() {
        return Err(ConfigError::Validation(
            "contact_email cannot be empty".to_string(),
        ));
    }

    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    let local = parts[0];
    let domain = parts[1];

    if local.is_empty() || domain.is_empty() {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    if !domain.contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email domain: '{}'",
            email
        )));
    }

    Ok(())
}
