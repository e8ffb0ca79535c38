//! Naver cafe archiver library.
//!
//! Runs keyword- and cafe-scoped scrape jobs one at a time: discovers
//! candidate articles through the cafe search API, renders them in a
//! headless browser, filters and deduplicates the extracted posts, and
//! stores them in SQLite while streaming rows to a spreadsheet sink.

#![allow(clippy::needless_raw_string_hashes)]

pub mod browser;
pub mod collector;
pub mod config;
pub mod constants;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod extractor;
pub mod filter;
pub mod logging;
pub mod pacing;
pub mod progress;
pub mod runner;
pub mod session;
pub mod sink;
