//! End-to-end crawl tests
//!
//! These tests use wiremock to serve index pages and check what a full
//! session writes to SQLite and records as its run checkpoint.

use archive_crawl::config::parse_config;
use archive_crawl::crawler::{
    run_crawl, BackoffPolicy, CrawlOptions, CrawlSession, HttpFetcher, IndexFormat, IndexQuery,
    RateLimiter, RetryingFetcher,
};
use archive_crawl::storage::{
    D1Config, D1Sink, RecordSink, RunStatus, RunStore, SqliteSink, SqliteStorage,
};
use archive_crawl::TerminationReason;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HEADER: &str = r#"["urlkey","timestamp","original","mimetype","statuscode","digest","length"]"#;

/// CDX JSON body: header, one row per URL, then the resume key if any
fn cdx_body(urls: &[&str], resume_key: Option<&str>) -> String {
    let mut rows = vec![HEADER.to_string()];
    for url in urls {
        rows.push(format!(
            r#"["in,factly)/","20210301000000","{}","text/html","200","ABC","512"]"#,
            url
        ));
    }
    if let Some(key) = resume_key {
        rows.push("[]".to_string());
        rows.push(format!(r#"["{}"]"#, key));
    }
    format!("[{}]", rows.join(",\n"))
}

fn json_page(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_string(body)
        .insert_header("content-type", "application/json")
}

/// Mounts a CDX page served for `resumeKey=<cursor>`
async fn mount_page(server: &MockServer, cursor: &str, urls: &[&str], next: Option<&str>) {
    Mock::given(method("GET"))
        .and(path("/cdx"))
        .and(query_param("resumeKey", cursor))
        .respond_with(json_page(cdx_body(urls, next)))
        .mount(server)
        .await;
}

/// Mounts the first page; mount it after every cursor-specific page
async fn mount_first_page(server: &MockServer, urls: &[&str], next: Option<&str>) {
    Mock::given(method("GET"))
        .and(path("/cdx"))
        .respond_with(json_page(cdx_body(urls, next)))
        .mount(server)
        .await;
}

fn fetcher() -> RetryingFetcher {
    RetryingFetcher::new(
        Arc::new(HttpFetcher::new(reqwest::Client::new())),
        Arc::new(RateLimiter::new(Duration::ZERO)),
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 2),
    )
}

fn open_db() -> (TempDir, Arc<Mutex<SqliteStorage>>) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let storage = SqliteStorage::new(&dir.path().join("crawl.db"), "archive_records")
        .expect("Failed to open database");
    (dir, Arc::new(Mutex::new(storage)))
}

fn session(storage: &Arc<Mutex<SqliteStorage>>) -> CrawlSession {
    let store: Arc<Mutex<dyn RunStore + Send>> = storage.clone();
    CrawlSession::new(fetcher(), Arc::new(SqliteSink::new(Arc::clone(storage))))
        .with_sink_policy(BackoffPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(5),
            3,
        ))
        .with_checkpoints(store, "test-config", false)
}

fn cdx_query(server: &MockServer) -> IndexQuery {
    IndexQuery::new(
        format!("{}/cdx", server.uri()),
        "factly.in/",
        IndexFormat::CdxJson,
    )
}

fn keys(storage: &Arc<Mutex<SqliteStorage>>) -> Vec<String> {
    storage.lock().unwrap().natural_keys().unwrap()
}

#[tokio::test]
async fn test_paginates_until_empty_page() {
    let server = MockServer::start().await;
    mount_page(&server, "k1", &["https://factly.in/c"], Some("k2")).await;
    mount_page(&server, "k2", &[], None).await;
    mount_first_page(
        &server,
        &["https://factly.in/a", "https://factly.in/b"],
        Some("k1"),
    )
    .await;

    let (_dir, storage) = open_db();
    let summary = session(&storage).run(cdx_query(&server)).await.unwrap();

    assert_eq!(summary.terminated_reason, TerminationReason::Exhausted);
    assert_eq!(summary.pages_fetched, 2);
    assert_eq!(summary.records_seen, 3);
    assert_eq!(summary.records_written, 3);
    assert_eq!(summary.records_failed, 0);
    assert_eq!(summary.last_cursor.as_deref(), Some("k1"));
    assert_eq!(keys(&storage), vec!["factly.in/a", "factly.in/b", "factly.in/c"]);

    let run = storage
        .lock()
        .unwrap()
        .get_run(summary.run_id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.terminated_reason.as_deref(), Some("exhausted"));
    assert_eq!(run.records_written, 3);
}

#[tokio::test]
async fn test_repeated_resume_key_stops_without_progress() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cdx"))
        .and(query_param("resumeKey", "k1"))
        .respond_with(json_page(cdx_body(&["https://factly.in/b"], Some("k1"))))
        .expect(1)
        .mount(&server)
        .await;
    mount_first_page(&server, &["https://factly.in/a"], Some("k1")).await;

    let (_dir, storage) = open_db();
    let summary = session(&storage).run(cdx_query(&server)).await.unwrap();

    assert_eq!(summary.terminated_reason, TerminationReason::NoProgress);
    assert_eq!(summary.pages_fetched, 1);
    assert_eq!(keys(&storage), vec!["factly.in/a"]);
}

#[tokio::test]
async fn test_tracking_variants_are_written_once() {
    let server = MockServer::start().await;
    mount_first_page(
        &server,
        &[
            "https://factly.in/a?utm_source=twitter",
            "https://www.factly.in/a/",
            "http://factly.in/a",
            "https://factly.in/b",
        ],
        None,
    )
    .await;

    let (_dir, storage) = open_db();
    let summary = session(&storage).run(cdx_query(&server)).await.unwrap();

    assert_eq!(summary.records_seen, 4);
    assert_eq!(summary.records_written, 2);
    assert_eq!(summary.records_skipped_duplicate, 2);
    assert_eq!(keys(&storage), vec!["factly.in/a", "factly.in/b"]);
}

#[tokio::test]
async fn test_replay_updates_without_duplicating() {
    let server = MockServer::start().await;
    mount_first_page(
        &server,
        &["https://factly.in/a", "https://factly.in/b"],
        None,
    )
    .await;

    let (_dir, storage) = open_db();
    session(&storage).run(cdx_query(&server)).await.unwrap();
    let first = storage
        .lock()
        .unwrap()
        .get_record("factly.in/a")
        .unwrap()
        .unwrap();

    let summary = session(&storage).run(cdx_query(&server)).await.unwrap();
    let second = storage
        .lock()
        .unwrap()
        .get_record("factly.in/a")
        .unwrap()
        .unwrap();

    assert_eq!(summary.records_written, 2);
    assert_eq!(storage.lock().unwrap().count_records().unwrap(), 2);
    assert_eq!(first.created_at, second.created_at);
    assert_eq!(second.record.timestamp.as_deref(), Some("20210301000000"));
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cdx"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let (_dir, storage) = open_db();
    let summary = session(&storage).run(cdx_query(&server)).await.unwrap();

    assert_eq!(summary.terminated_reason, TerminationReason::FetchError);
    assert_eq!(summary.pages_fetched, 0);
    assert_eq!(storage.lock().unwrap().count_records().unwrap(), 0);

    let run = storage
        .lock()
        .unwrap()
        .get_run(summary.run_id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_malformed_body_ends_as_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cdx"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let (_dir, storage) = open_db();
    let summary = session(&storage).run(cdx_query(&server)).await.unwrap();

    assert_eq!(summary.terminated_reason, TerminationReason::ProtocolError);
    assert_eq!(summary.records_seen, 0);
}

#[tokio::test]
async fn test_failed_run_resumes_from_checkpoint() {
    let server = MockServer::start().await;

    // Fails for every attempt of the first session, then recovers
    Mock::given(method("GET"))
        .and(path("/cdx"))
        .and(query_param("resumeKey", "k2"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    mount_page(&server, "k2", &["https://factly.in/d"], None).await;
    mount_page(&server, "k1", &["https://factly.in/c"], Some("k2")).await;
    Mock::given(method("GET"))
        .and(path("/cdx"))
        .respond_with(json_page(cdx_body(
            &["https://factly.in/a", "https://factly.in/b"],
            Some("k1"),
        )))
        .expect(1)
        .mount(&server)
        .await;

    let (_dir, storage) = open_db();

    let first = session(&storage).run(cdx_query(&server)).await.unwrap();
    assert_eq!(first.terminated_reason, TerminationReason::FetchError);
    assert_eq!(first.pages_fetched, 2);
    assert_eq!(first.last_cursor.as_deref(), Some("k1"));

    let second = session(&storage).run(cdx_query(&server)).await.unwrap();
    assert_eq!(second.terminated_reason, TerminationReason::Exhausted);
    assert_eq!(second.pages_fetched, 2);
    assert_eq!(second.records_seen, 2);
    assert_ne!(second.run_id, first.run_id);

    assert_eq!(
        keys(&storage),
        vec!["factly.in/a", "factly.in/b", "factly.in/c", "factly.in/d"]
    );

    let resumed = storage
        .lock()
        .unwrap()
        .get_run(second.run_id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_fresh_run_ignores_checkpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cdx"))
        .and(query_param("resumeKey", "k1"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cdx"))
        .respond_with(json_page(cdx_body(&["https://factly.in/a"], Some("k1"))))
        .expect(2)
        .mount(&server)
        .await;

    let (_dir, storage) = open_db();
    let first = session(&storage).run(cdx_query(&server)).await.unwrap();
    assert_eq!(first.terminated_reason, TerminationReason::FetchError);

    let store: Arc<Mutex<dyn RunStore + Send>> = storage.clone();
    let fresh = session(&storage)
        .with_checkpoints(store, "test-config", true)
        .run(cdx_query(&server))
        .await
        .unwrap();

    assert_eq!(fresh.terminated_reason, TerminationReason::FetchError);
    assert_eq!(fresh.pages_fetched, 1);
}

#[tokio::test]
async fn test_cancellation_interrupts_slow_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cdx"))
        .and(query_param("resumeKey", "k1"))
        .respond_with(
            json_page(cdx_body(&["https://factly.in/b"], None)).set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;
    mount_first_page(&server, &["https://factly.in/a"], Some("k1")).await;

    let (_dir, storage) = open_db();
    let token = CancellationToken::new();
    let crawl = session(&storage).with_cancellation(token.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
    });

    let summary = tokio::time::timeout(Duration::from_secs(10), crawl.run(cdx_query(&server)))
        .await
        .expect("cancellation did not stop the session")
        .unwrap();
    canceller.await.unwrap();

    assert_eq!(summary.terminated_reason, TerminationReason::Cancelled);
    assert_eq!(summary.pages_fetched, 1);
    assert_eq!(keys(&storage), vec!["factly.in/a"]);

    let run = storage
        .lock()
        .unwrap()
        .get_run(summary.run_id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Interrupted);
}

#[tokio::test]
async fn test_sitemap_tree_traversal() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/sitemap.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>{base}/post-sitemap.xml</loc></sitemap>
  <sitemap><loc>{base}/page-sitemap.xml</loc></sitemap>
  <sitemap><loc>{base}/post-sitemap.xml</loc></sitemap>
</sitemapindex>"#
        )))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/post-sitemap.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://factly.in/fact-check-1/</loc><lastmod>2024-03-01</lastmod></url>
  <url><loc>https://factly.in/fact-check-2/</loc></url>
</urlset>"#,
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page-sitemap.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://factly.in/about/</loc></url>
  <url><loc>https://factly.in/fact-check-1</loc></url>
</urlset>"#,
        ))
        .expect(1)
        .mount(&server)
        .await;

    let (_dir, storage) = open_db();
    let query = IndexQuery::new(format!("{}/sitemap.xml", base), "", IndexFormat::Sitemap);
    let summary = session(&storage).run(query).await.unwrap();

    assert_eq!(summary.terminated_reason, TerminationReason::Exhausted);
    assert_eq!(summary.pages_fetched, 2);
    assert_eq!(summary.records_seen, 4);
    assert_eq!(summary.records_written, 3);
    assert_eq!(summary.records_skipped_duplicate, 1);
    assert_eq!(
        keys(&storage),
        vec!["factly.in/about", "factly.in/fact-check-1", "factly.in/fact-check-2"]
    );
}

fn d1_config(server: &MockServer) -> D1Config {
    D1Config {
        api_base: server.uri(),
        account_id: "acct".to_string(),
        database_id: "db".to_string(),
        api_token: "secret".to_string(),
        table: "archive_records".to_string(),
    }
}

async fn mount_d1_ping(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/accounts/acct/d1/database/db"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"success":true,"errors":[]}"#))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_d1_sink_retries_transient_errors() {
    let index = MockServer::start().await;
    mount_first_page(&index, &["https://factly.in/a"], None).await;

    let d1 = MockServer::start().await;
    mount_d1_ping(&d1).await;
    Mock::given(method("POST"))
        .and(path("/accounts/acct/d1/database/db/query"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .up_to_n_times(2)
        .mount(&d1)
        .await;
    Mock::given(method("POST"))
        .and(path("/accounts/acct/d1/database/db/query"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"success":true,"errors":[],"result":[{"results":[{"created_at":"t1","updated_at":"t1"}]}]}"#,
        ))
        .expect(1)
        .mount(&d1)
        .await;

    let sink: Arc<dyn RecordSink> = Arc::new(D1Sink::new(reqwest::Client::new(), d1_config(&d1)));
    let summary = CrawlSession::new(fetcher(), sink)
        .with_sink_policy(BackoffPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(5),
            3,
        ))
        .run(cdx_query(&index))
        .await
        .unwrap();

    assert_eq!(summary.records_written, 1);
    assert_eq!(summary.records_failed, 0);
    assert_eq!(summary.run_id, None);
}

#[tokio::test]
async fn test_d1_missing_table_aborts_batch() {
    let index = MockServer::start().await;
    mount_first_page(
        &index,
        &["https://factly.in/a", "https://factly.in/b", "https://factly.in/c"],
        Some("k1"),
    )
    .await;

    let d1 = MockServer::start().await;
    mount_d1_ping(&d1).await;
    Mock::given(method("POST"))
        .and(path("/accounts/acct/d1/database/db/query"))
        .respond_with(ResponseTemplate::new(400).set_body_string(
            r#"{"success":false,"errors":[{"code":7500,"message":"no such table: archive_records: SQLITE_ERROR"}],"result":[]}"#,
        ))
        .mount(&d1)
        .await;

    let sink: Arc<dyn RecordSink> = Arc::new(D1Sink::new(reqwest::Client::new(), d1_config(&d1)));
    let summary = CrawlSession::new(fetcher(), sink)
        .with_concurrency(1)
        .run(cdx_query(&index))
        .await
        .unwrap();

    assert_eq!(summary.terminated_reason, TerminationReason::SinkFatal);
    assert_eq!(summary.records_written, 0);
    assert_eq!(summary.last_cursor, None);
}

#[tokio::test]
async fn test_run_crawl_from_config() {
    let server = MockServer::start().await;
    mount_page(&server, "k1", &["https://factly.in/b"], None).await;
    mount_first_page(&server, &["https://factly.in/a"], Some("k1")).await;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("crawl.db");
    let toml = format!(
        r#"
[crawler]
concurrency = 4
retry-count = 1
backoff-base-ms = 1
backoff-max-ms = 5
sleep-between-pages-ms = 0

[user-agent]
crawler-name = "TestBot"
crawler-version = "1.0.0"
contact-url = "https://example.com/contact"
contact-email = "test@example.com"

[source]
kind = "cdx"
base-url = "{}/cdx"
domain = "https://factly.in/"

[output]
database-path = "{}"
"#,
        server.uri(),
        db_path.display()
    );
    let config = parse_config(&toml).unwrap();

    let options = CrawlOptions {
        config_hash: "abc123".to_string(),
        ..CrawlOptions::default()
    };
    let summary = run_crawl(&config, options).await.unwrap();

    assert_eq!(summary.terminated_reason, TerminationReason::Exhausted);
    assert_eq!(summary.records_written, 2);

    let storage = SqliteStorage::new(&db_path, "archive_records").unwrap();
    assert_eq!(storage.count_records().unwrap(), 2);
    let runs = storage.recent_runs(5).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].config_hash, "abc123");
    assert_eq!(runs[0].status, RunStatus::Completed);
}
