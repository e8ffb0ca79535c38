//! Shared fixtures for integration tests: a temp database, a session file,
//! canned search API responses, and an in-memory page driver.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use cafe_archiver::browser::{DriverError, PageDriver, PageFactory};
use cafe_archiver::config::Config;
use cafe_archiver::constants::cancel_key;
use cafe_archiver::db::{upsert_setting, Database};
use cafe_archiver::session::StorageState;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tempfile::TempDir;

pub async fn setup_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.sqlite");
    let db = Database::new(&db_path)
        .await
        .expect("Failed to create database");
    (db, temp_dir)
}

pub fn write_session_file(dir: &Path) -> PathBuf {
    let path = dir.join("session.json");
    let state = json!({
        "cookies": [
            {"name": "NID_AUT", "value": "aut", "domain": ".naver.com", "path": "/"},
            {"name": "NID_SES", "value": "ses", "domain": ".naver.com", "path": "/"}
        ],
        "origins": []
    });
    std::fs::write(&path, state.to_string()).expect("Failed to write session file");
    path
}

/// Config pointed at a mock server, with a session file and data under `dir`.
pub fn test_config(dir: &Path, server_uri: &str) -> Config {
    Config {
        database_path: dir.join("test.sqlite"),
        data_dir: dir.join("data"),
        session_state_path: Some(write_session_file(dir)),
        cafe_base_url: server_uri.to_string(),
        mobile_cafe_base_url: format!("{server_uri}/m"),
        api_base_url: server_uri.to_string(),
        ..Config::for_testing()
    }
}

/// One row of the mobile search API.
pub fn search_row(article_id: u64, subject: &str, board: &str, add_date_ms: i64) -> Value {
    json!({
        "type": "ARTICLE",
        "item": {
            "articleId": article_id,
            "subject": subject,
            "readCount": 100 + article_id,
            "likeItCount": 2,
            "commentCount": 1,
            "boardType": "L",
            "menuName": board,
            "addDate": add_date_ms,
        }
    })
}

pub fn search_body(rows: Vec<Value>) -> Value {
    json!({"message": {"status": "200", "result": {"articleList": rows}}})
}

/// A rendered article page with a body, a view count, and one comment.
pub fn article_html(title: &str, body: &str, views: i64) -> String {
    format!(
        r#"<html><head><title>{title} : 네이버 카페</title></head><body>
<h3 class="title_text">{title}</h3>
<div class="nick_box"><button class="nickname">작성자</button></div>
<span class="date">2024.05.01. 09:30</span><span class="count">조회 {views}</span>
<div class="se-main-container"><p>{body}</p></div>
<ul class="comment_list"><li class="CommentItem"><span class="text_comment">좋은 글이네요</span></li></ul>
</body></html>"#
    )
}

pub fn join_wall_html() -> String {
    r#"<html><head><title>네이버 카페</title></head><body>
<div class="guide_box">카페에 가입하면 바로 글을 볼 수 있어요</div>
<a class="btn_join">카페 가입하기</a>
</body></html>"#
        .to_string()
}

/// Serves canned HTML per URL and records every navigation.
#[derive(Clone, Default)]
pub struct FakeBrowser {
    pages: Arc<HashMap<String, String>>,
    visits: Arc<Mutex<Vec<String>>>,
    cancel_on_first_visit: Option<(SqlitePool, i64)>,
}

impl FakeBrowser {
    pub fn new(pages: HashMap<String, String>) -> Self {
        Self {
            pages: Arc::new(pages),
            ..Self::default()
        }
    }

    /// Set the job's cancel flag the first time any page is opened.
    pub fn cancelling(mut self, pool: SqlitePool, job_id: i64) -> Self {
        self.cancel_on_first_visit = Some((pool, job_id));
        self
    }

    pub fn visits(&self) -> Vec<String> {
        self.visits.lock().expect("visits lock").clone()
    }
}

#[async_trait]
impl PageFactory for FakeBrowser {
    async fn open(&self, _session: &StorageState) -> Result<Box<dyn PageDriver>> {
        Ok(Box::new(FakePage {
            browser: self.clone(),
            current: Mutex::new(None),
        }))
    }
}

struct FakePage {
    browser: FakeBrowser,
    current: Mutex<Option<String>>,
}

#[async_trait]
impl PageDriver for FakePage {
    async fn goto(&self, url: &str) -> Result<(), DriverError> {
        let first = {
            let mut visits = self.browser.visits.lock().expect("visits lock");
            visits.push(url.to_string());
            visits.len() == 1
        };
        if first {
            if let Some((pool, job_id)) = &self.browser.cancel_on_first_visit {
                upsert_setting(pool, &cancel_key(*job_id), "1")
                    .await
                    .map_err(|e| DriverError::Browser(e.to_string()))?;
            }
        }
        *self.current.lock().expect("current lock") = Some(url.to_string());
        Ok(())
    }

    async fn html(&self) -> Result<String, DriverError> {
        let current = self.current.lock().expect("current lock").clone();
        Ok(current
            .and_then(|url| self.browser.pages.get(&url).cloned())
            .unwrap_or_else(|| "<html><body></body></html>".to_string()))
    }

    async fn scroll_by(&self, _pixels: i64) -> Result<(), DriverError> {
        Ok(())
    }

    async fn count(&self, _selector: &str) -> Result<usize, DriverError> {
        Ok(1)
    }

    async fn click_first(&self, _selector: &str) -> Result<bool, DriverError> {
        Ok(false)
    }

    async fn close(&self) {}
}

/// URL the extractor opens first for a numeric cafe article.
pub fn modern_article_url(base: &str, cafe_id: &str, article_id: u64) -> String {
    format!("{base}/ca-fe/cafes/{cafe_id}/articles/{article_id}")
}
