//! Statistics generation from the crawl database
//!
//! This module provides functionality for extracting and displaying
//! record and run statistics from the storage layer.

use crate::state::TerminationReason;
use crate::storage::{RunRecord, RunStore};
use crate::CrawlError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Database statistics summary
#[derive(Debug, Clone)]
pub struct CrawlStatistics {
    /// Total number of stored records
    pub total_records: u64,

    /// Records that carry a hashtag
    pub tagged_records: u64,

    /// Most recent runs, newest first
    pub recent_runs: Vec<RunRecord>,

    /// How the recent runs ended
    pub runs_by_reason: HashMap<String, u64>,
}

/// Loads statistics from storage
///
/// # Arguments
///
/// * `store` - The run store to query
/// * `run_limit` - How many recent runs to include
///
/// # Returns
///
/// * `Ok(CrawlStatistics)` - Successfully loaded statistics
/// * `Err(CrawlError)` - Failed to query statistics
pub fn load_statistics(
    store: &dyn RunStore,
    run_limit: usize,
) -> Result<CrawlStatistics, CrawlError> {
    let total_records = store.count_records()?;
    let tagged_records = store.count_tagged_records()?;
    let recent_runs = store.recent_runs(run_limit)?;

    let mut runs_by_reason = HashMap::new();
    for run in &recent_runs {
        let reason = run
            .terminated_reason
            .clone()
            .unwrap_or_else(|| "unfinished".to_string());
        *runs_by_reason.entry(reason).or_insert(0) += 1;
    }

    Ok(CrawlStatistics {
        total_records,
        tagged_records,
        recent_runs,
        runs_by_reason,
    })
}

/// Wall-clock duration of a finished run, in seconds
pub fn run_duration_seconds(run: &RunRecord) -> Option<u64> {
    let started = run.started_at.parse::<DateTime<Utc>>().ok()?;
    let finished = run.finished_at.as_ref()?.parse::<DateTime<Utc>>().ok()?;
    u64::try_from((finished - started).num_seconds()).ok()
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `stats` - The statistics to display
pub fn print_statistics(stats: &CrawlStatistics) {
    println!("=== Crawl Statistics ===\n");

    println!("Records:");
    println!("  Total records: {}", stats.total_records);
    println!("  Tagged records: {}", stats.tagged_records);
    println!();

    if stats.recent_runs.is_empty() {
        println!("No crawl runs recorded.");
        return;
    }

    println!("Recent Runs:");
    for run in &stats.recent_runs {
        let reason = run.terminated_reason.as_deref().unwrap_or("-");
        let duration = run_duration_seconds(run)
            .map(|s| format!("{}s", s))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  #{} {} [{}] reason={} pages={} written={} duration={}",
            run.id,
            run.started_at,
            run.status.to_db_string(),
            reason,
            run.pages_fetched,
            run.records_written,
            duration
        );
        if let Some(cursor) = &run.checkpoint_cursor {
            println!("      checkpoint: {}", cursor);
        }
    }
    println!();

    println!("Runs by Termination Reason:");
    let mut reasons: Vec<_> = stats.runs_by_reason.iter().collect();
    reasons.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    for (reason, count) in reasons {
        let marker = match TerminationReason::from_db_string(reason) {
            Some(r) if !r.is_clean() => " (failed)",
            _ => "",
        };
        println!("  {}: {}{}", reason, count, marker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Record, RunStatus, SqliteStorage};

    #[test]
    fn test_load_statistics() {
        let mut storage = SqliteStorage::new_in_memory("records").unwrap();
        let mut tagged = Record::new("cats", "https://www.tiktok.com/tag/cats");
        tagged.tag = Some("cats".to_string());
        storage.upsert_record(&tagged).unwrap();
        storage
            .upsert_record(&Record::new("a.com/x", "https://a.com/x"))
            .unwrap();

        let first = storage.create_run("cfg", "fp", None).unwrap();
        storage
            .finish_run(first, RunStatus::Completed, "exhausted")
            .unwrap();
        let second = storage.create_run("cfg", "fp", None).unwrap();
        storage
            .finish_run(second, RunStatus::Failed, "fetch-error")
            .unwrap();
        storage.create_run("cfg", "fp", None).unwrap();

        let stats = load_statistics(&storage, 10).unwrap();

        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.tagged_records, 1);
        assert_eq!(stats.recent_runs.len(), 3);
        assert_eq!(stats.recent_runs[0].status, RunStatus::Running);
        assert_eq!(stats.runs_by_reason.get("exhausted"), Some(&1));
        assert_eq!(stats.runs_by_reason.get("fetch-error"), Some(&1));
        assert_eq!(stats.runs_by_reason.get("unfinished"), Some(&1));
    }

    #[test]
    fn test_run_duration() {
        let mut storage = SqliteStorage::new_in_memory("records").unwrap();
        let run_id = storage.create_run("cfg", "fp", None).unwrap();
        let mut run = storage.get_run(run_id).unwrap().unwrap();
        assert_eq!(run_duration_seconds(&run), None);

        run.started_at = "2024-01-01T00:00:00+00:00".to_string();
        run.finished_at = Some("2024-01-01T00:01:30+00:00".to_string());
        assert_eq!(run_duration_seconds(&run), Some(90));
    }
}
