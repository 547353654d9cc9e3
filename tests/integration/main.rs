//! Integration tests for archive-crawl
//!
//! Each test stands up a wiremock index server and runs a full session
//! against a SQLite database in a temporary directory.

mod crawl_tests;
