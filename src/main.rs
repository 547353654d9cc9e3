//! archive-crawl main entry point
//!
//! This is the command-line interface for the archive-crawl index crawler.

use anyhow::Context;
use archive_crawl::config::{load_config_with_hash, Config};
use archive_crawl::crawler::{run_crawl, CrawlOptions, IndexQuery, SessionProgress};
use archive_crawl::output::{load_statistics, print_statistics, print_summary};
use archive_crawl::storage::open_storage;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// archive-crawl: a resumable web-archive index crawler
///
/// archive-crawl pages through a capture index (Wayback CDX, Common Crawl,
/// or a sitemap tree), deduplicates the URLs it finds and writes each one
/// once into SQLite or Cloudflare D1. Interrupted runs resume from their
/// last checkpoint.
#[derive(Parser, Debug)]
#[command(name = "archive-crawl")]
#[command(version)]
#[command(about = "A resumable web-archive index crawler", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Start from the first page, ignoring earlier checkpoints
    #[arg(long)]
    fresh: bool,

    /// Validate config and show the first request without crawling
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show statistics from the database and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,

    /// Number of recent runs shown by --stats
    #[arg(long, default_value_t = 10)]
    runs: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.dry_run {
        handle_dry_run(&config)
    } else if cli.stats {
        handle_stats(&config, cli.runs)
    } else {
        handle_crawl(&config, config_hash, cli.fresh).await
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
///
/// `RUST_LOG` takes precedence when set.
fn setup_logging(verbose: u8, quiet: bool) {
    let default = if quiet {
        "error"
    } else {
        match verbose {
            0 => "archive_crawl=info,warn",
            1 => "archive_crawl=debug,info",
            2 => "archive_crawl=trace,debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: validates the query and shows the first request
fn handle_dry_run(config: &Config) -> anyhow::Result<()> {
    let query = IndexQuery::from_source(&config.source)?;

    println!("=== archive-crawl Dry Run ===\n");

    println!("Source:");
    println!("  Kind: {:?}", config.source.kind);
    println!("  Pattern: {}", query.domain_filter);
    println!("  First request: {}", query.page_url(None)?);
    println!("  Query fingerprint: {}", query.fingerprint()?);
    println!("  Resumable: {}", query.supports_resume());

    println!("\nCrawler:");
    println!("  Concurrency: {}", config.crawler.concurrency);
    println!(
        "  Sleep between requests: {}ms",
        config.crawler.sleep_between_pages_ms
    );
    println!("  Retries: {}", config.crawler.retry_count);
    println!("  Request timeout: {}s", config.crawler.request_timeout_secs);
    if config.crawler.max_total_items > 0 {
        println!("  Max items: {}", config.crawler.max_total_items);
    }

    println!("\nUser Agent:");
    println!("  {}", config.user_agent.header_value());

    println!("\nOutput:");
    println!("  Backend: {:?}", config.output.backend);
    println!("  Database: {}", config.output.database_path);
    println!("  Table: {}", config.output.table);

    println!("\n✓ Configuration is valid");

    Ok(())
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(config: &Config, runs: usize) -> anyhow::Result<()> {
    println!("Database: {}\n", config.output.database_path);

    let storage = open_storage(Path::new(&config.output.database_path), &config.output.table)?;
    let stats = load_statistics(&storage, runs)?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(config: &Config, config_hash: String, fresh: bool) -> anyhow::Result<()> {
    if fresh {
        tracing::info!("Starting fresh crawl (ignoring earlier checkpoints)");
    } else {
        tracing::info!("Starting crawl (will resume an unfinished run for this query)");
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; stopping after in-flight records");
            on_signal.cancel();
        }
    });

    let options = CrawlOptions {
        fresh,
        config_hash,
        cancel,
        progress: Some(Arc::new(|progress: &SessionProgress| {
            tracing::debug!(
                "Checkpoint after page {}: {}",
                progress.pages_fetched,
                progress.cursor.as_deref().unwrap_or("<first page>")
            );
        })),
    };

    let summary = run_crawl(config, options).await.map_err(|e| {
        tracing::error!("Crawl failed: {}", e);
        e
    })?;

    print_summary(&summary);

    if summary.terminated_reason.is_clean() {
        Ok(())
    } else {
        anyhow::bail!("crawl stopped: {}", summary.terminated_reason)
    }
}
