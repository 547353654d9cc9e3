//! Output module for crawl summaries and statistics
//!
//! This module handles:
//! - Rendering a finished session's summary
//! - Loading and printing record and run statistics

pub mod stats;

pub use stats::{load_statistics, print_statistics, run_duration_seconds, CrawlStatistics};

use crate::crawler::SessionSummary;

/// Renders a session summary as plain text
///
/// # Arguments
///
/// * `summary` - The summary returned by a crawl session
pub fn format_summary(summary: &SessionSummary) -> String {
    let mut lines = vec![
        "=== Crawl Summary ===".to_string(),
        format!("Terminated: {}", summary.terminated_reason),
        format!("Pages fetched: {}", summary.pages_fetched),
        format!("Records seen: {}", summary.records_seen),
        format!("Records written: {}", summary.records_written),
        format!("Duplicates skipped: {}", summary.records_skipped_duplicate),
        format!("Records failed: {}", summary.records_failed),
    ];

    if let Some(run_id) = summary.run_id {
        lines.push(format!("Run: {}", run_id));
    }

    if summary.terminated_reason.is_resumable() {
        match &summary.last_cursor {
            Some(cursor) => lines.push(format!("Resume from cursor: {}", cursor)),
            None => lines.push("Resume from the first page".to_string()),
        }
    }

    lines.join("\n")
}

/// Prints a session summary to stdout
pub fn print_summary(summary: &SessionSummary) {
    println!("{}", format_summary(summary));
}
