//! Integration tests for candidate collection against a mocked search API.

mod common;

use cafe_archiver::collector::{per_keyword_take, DateWindow, SearchClient, SearchQuery};
use cafe_archiver::session::load_session_file;
use common::{search_body, search_row, test_config};
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SEARCH_PATH: &str = "/cafe-web/cafe-mobile/CafeMobileWebArticleSearchListV4";
const DAY_MS: i64 = 86_400_000;
const BASE_MS: i64 = 1_714_521_600_000; // 2024-05-01T00:00:00Z

async fn client_for(server: &MockServer, dir: &TempDir, page_size: usize) -> SearchClient {
    let config = cafe_archiver::config::Config {
        search_page_size: page_size,
        ..test_config(dir.path(), &server.uri())
    };
    let session_path = config.session_state_path.clone().expect("session path");
    let session = load_session_file(&session_path).await.expect("session");
    SearchClient::new(&config, session).expect("client")
}

#[tokio::test]
async fn test_single_page_request_when_budget_is_met() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");

    // 50 rows in arbitrary date order; the first page already exceeds the budget.
    let rows = (1..=50)
        .map(|id| search_row(id, "집중 잘 되는 법", "자유게시판", BASE_MS + ((id as i64 * 7) % 50) * DAY_MS))
        .collect();
    Mock::given(method("GET"))
        .and(path(SEARCH_PATH))
        .and(query_param("cafeId", "77"))
        .and(query_param("query", "집중"))
        .and(query_param("sortBy", "date"))
        .respond_with(ResponseTemplate::new(200).set_body_json(search_body(rows)))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, &dir, 50).await;
    let budget = per_keyword_take(5, 1);
    let outcome = client
        .search_keyword(&SearchQuery {
            cafe_id: "77",
            keyword: "집중",
            budget,
            exclude_boards: &[],
            window: DateWindow::default(),
        })
        .await
        .expect("search");

    assert_eq!(outcome.pages_scanned, 1);
    assert!(outcome.candidates.len() <= 5);
    assert!(!outcome.candidates.is_empty());
    let dates: Vec<_> = outcome.candidates.iter().map(|c| c.added_at).collect();
    let mut sorted = dates.clone();
    sorted.sort_by(|a, b| b.cmp(a));
    assert_eq!(dates, sorted);

    let mut ids: Vec<_> = outcome.candidates.iter().map(|c| c.article_id).collect();
    ids.dedup();
    assert_eq!(ids.len(), outcome.candidates.len());
}

#[tokio::test]
async fn test_short_page_stops_pagination() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");

    let full_page = (1..=3).map(|id| search_row(id, "집중", "자유", BASE_MS + id as i64 * DAY_MS)).collect();
    let short_page = vec![search_row(4, "집중", "자유", BASE_MS)];
    Mock::given(method("GET"))
        .and(path(SEARCH_PATH))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(search_body(full_page)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(SEARCH_PATH))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(search_body(short_page)))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, &dir, 3).await;
    let outcome = client
        .search_keyword(&SearchQuery {
            cafe_id: "77",
            keyword: "집중",
            budget: 100,
            exclude_boards: &[],
            window: DateWindow::default(),
        })
        .await
        .expect("search");

    assert_eq!(outcome.pages_scanned, 2);
    assert_eq!(outcome.candidates.len(), 4);
    assert_eq!(outcome.candidates[0].article_id, 3);
}

#[tokio::test]
async fn test_excluded_boards_and_window_are_dropped() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");

    let rows = vec![
        search_row(1, "집중", "자유게시판", BASE_MS + 2 * DAY_MS),
        search_row(2, "집중", "가입인사", BASE_MS + 2 * DAY_MS),
        search_row(3, "집중", "자유게시판", BASE_MS - 30 * DAY_MS),
    ];
    Mock::given(method("GET"))
        .and(path(SEARCH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(search_body(rows)))
        .mount(&server)
        .await;

    let client = client_for(&server, &dir, 50).await;
    let exclude = vec!["가입 인사".to_string()];
    let outcome = client
        .search_keyword(&SearchQuery {
            cafe_id: "77",
            keyword: "집중",
            budget: 10,
            exclude_boards: &exclude,
            window: DateWindow::from_bounds(Some("2024-05-01"), Some("2024-05-31")),
        })
        .await
        .expect("search");

    let ids: Vec<_> = outcome.candidates.iter().map(|c| c.article_id).collect();
    assert_eq!(ids, vec![1]);
    assert_eq!(outcome.excluded, 1);
    assert_eq!(outcome.out_of_range, 1);
}

#[tokio::test]
async fn test_slug_resolution_is_cached() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");

    Mock::given(method("GET"))
        .and(path("/studycafe"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"<script>var g_sClubId = "28385054";</script>"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, &dir, 50).await;
    assert_eq!(client.resolve_cafe_id("12345", None).await.expect("numeric"), "12345");
    assert_eq!(client.resolve_cafe_id("studycafe", None).await.expect("slug"), "28385054");
    assert_eq!(client.resolve_cafe_id("studycafe", None).await.expect("cached"), "28385054");
}

#[tokio::test]
async fn test_unresolvable_slug_without_browser_fails() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");

    Mock::given(method("GET"))
        .and(path("/nowhere"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client_for(&server, &dir, 50).await;
    assert!(client.resolve_cafe_id("nowhere", None).await.is_err());
}

#[tokio::test]
async fn test_search_sends_session_cookies() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");

    Mock::given(method("GET"))
        .and(path(SEARCH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(search_body(vec![])))
        .mount(&server)
        .await;

    let client = client_for(&server, &dir, 50).await;
    let outcome = client
        .search_keyword(&SearchQuery {
            cafe_id: "77",
            keyword: "집중",
            budget: 10,
            exclude_boards: &[],
            window: DateWindow::default(),
        })
        .await
        .expect("search");
    assert!(outcome.candidates.is_empty());

    // Cookies are scoped to .naver.com; the mock host gets none.
    let requests = server.received_requests().await.expect("recorded requests");
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].headers.contains_key("cookie"));
}
