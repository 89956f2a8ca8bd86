//! Integration tests for the ingestion controller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

use subreddit_insights::config::Config;
use subreddit_insights::ingest::IngestController;
use subreddit_insights::reddit::RedditClient;
use subreddit_insights::store::RecordStore;

async fn setup_store() -> (RecordStore, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = RecordStore::open(temp_dir.path())
        .await
        .expect("Failed to open store");
    (store, temp_dir)
}

fn test_config(base_url: &str) -> Config {
    Config {
        reddit_base_url: base_url.to_string(),
        ..Config::for_testing()
    }
}

fn controller(config: &Config, store: RecordStore) -> IngestController {
    let client = RedditClient::new(config).expect("Failed to build client");
    IngestController::new(
        Arc::new(client),
        store,
        config.listing_backoff.clone(),
        config.ingest_concurrency,
        CancellationToken::new(),
    )
}

/// A `t3` listing child created `age_secs` ago.
fn post_child(id: &str, forum: &str, age_secs: i64) -> serde_json::Value {
    json!({
        "kind": "t3",
        "data": {
            "id": id,
            "subreddit": forum,
            "title": format!("post {id}"),
            "author": "student",
            "created_utc": (Utc::now().timestamp() - age_secs) as f64,
            "score": 5,
            "num_comments": 1,
            "selftext": "some body text",
            "url": format!("https://www.reddit.com/r/{forum}/comments/{id}/"),
            "permalink": format!("/r/{forum}/comments/{id}/"),
            "upvote_ratio": 0.9
        }
    })
}

fn listing(children: Vec<serde_json::Value>, after: Option<&str>) -> serde_json::Value {
    json!({ "kind": "Listing", "data": { "children": children, "after": after } })
}

#[tokio::test]
async fn test_paginates_until_window_boundary() {
    let (store, _dir) = setup_store().await;
    let server = MockServer::start().await;

    let week = 7 * 24 * 3600;
    // Page 1: two posts inside the window, cursor to page 2
    Mock::given(method("GET"))
        .and(path("/r/HomeworkHelp/new.json"))
        .and(query_param_is_missing("after"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing(
            vec![
                post_child("new1", "HomeworkHelp", 3600),
                post_child("new2", "HomeworkHelp", 2 * 3600),
            ],
            Some("t3_c1"),
        )))
        .expect(1)
        .mount(&server)
        .await;
    // Page 2: one post inside the window, one past it; cursor to page 3
    Mock::given(method("GET"))
        .and(path("/r/HomeworkHelp/new.json"))
        .and(query_param("after", "t3_c1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing(
            vec![
                post_child("new3", "HomeworkHelp", week - 3600),
                post_child("old1", "HomeworkHelp", week + 3600),
            ],
            Some("t3_c2"),
        )))
        .expect(1)
        .mount(&server)
        .await;
    // Page 3 must never be requested: the window boundary ends the walk
    Mock::given(method("GET"))
        .and(path("/r/HomeworkHelp/new.json"))
        .and(query_param("after", "t3_c2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing(vec![], None)))
        .expect(0)
        .mount(&server)
        .await;

    let config = test_config(&server.uri());
    let report = controller(&config, store.clone())
        .ingest(
            &["HomeworkHelp".to_string()],
            Duration::from_secs(week as u64),
        )
        .await
        .unwrap();

    assert_eq!(report.tallies[0].written, 3);
    assert!(report.partial_failures.is_empty());

    let keys = store.list("posts").await.unwrap();
    assert_eq!(keys.len(), 3);
    assert!(!keys.contains(&"posts/HomeworkHelp/old1".to_string()));
}

#[tokio::test]
async fn test_reingest_is_idempotent() {
    let (store, _dir) = setup_store().await;
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/r/HomeworkHelp/new.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing(
            vec![
                post_child("aaa", "HomeworkHelp", 3600),
                post_child("bbb", "HomeworkHelp", 7200),
            ],
            None,
        )))
        .mount(&server)
        .await;

    let config = test_config(&server.uri());
    let forums = vec!["HomeworkHelp".to_string()];
    let window = Duration::from_secs(24 * 3600);

    let first = controller(&config, store.clone())
        .ingest(&forums, window)
        .await
        .unwrap();
    assert_eq!(first.tallies[0].written, 2);
    assert_eq!(first.tallies[0].duplicates, 0);

    let second = controller(&config, store.clone())
        .ingest(&forums, window)
        .await
        .unwrap();
    assert_eq!(second.tallies[0].written, 0);
    assert_eq!(second.tallies[0].duplicates, 2);

    // Key count unchanged by the second run
    assert_eq!(store.list("posts").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_skips_comments_and_image_posts() {
    let (store, _dir) = setup_store().await;
    let server = MockServer::start().await;

    let comment = json!({
        "kind": "t1",
        "data": { "id": "c1", "created_utc": Utc::now().timestamp() as f64 }
    });
    let mut image = post_child("img1", "HomeworkHelp", 3600);
    image["data"]["url"] = json!("https://i.redd.it/whiteboard.JPG");

    Mock::given(method("GET"))
        .and(path("/r/HomeworkHelp/new.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing(
            vec![comment, image, post_child("keep1", "HomeworkHelp", 3600)],
            None,
        )))
        .mount(&server)
        .await;

    let config = test_config(&server.uri());
    let report = controller(&config, store.clone())
        .ingest(
            &["HomeworkHelp".to_string()],
            Duration::from_secs(24 * 3600),
        )
        .await
        .unwrap();

    let tally = &report.tallies[0];
    assert_eq!(tally.written, 1);
    assert_eq!(tally.skipped_non_posts, 1);
    assert_eq!(tally.skipped_images, 1);
    assert_eq!(
        store.list("posts").await.unwrap(),
        vec!["posts/HomeworkHelp/keep1"]
    );
}

#[tokio::test]
async fn test_rate_limit_retried_with_backoff() {
    let (store, _dir) = setup_store().await;
    let server = MockServer::start().await;

    // Two 429s, then the real page: well inside the retry budget of 3
    Mock::given(method("GET"))
        .and(path("/r/HomeworkHelp/new.json"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/r/HomeworkHelp/new.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing(
            vec![post_child("aaa", "HomeworkHelp", 3600)],
            None,
        )))
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(&server.uri());
    let report = controller(&config, store.clone())
        .ingest(
            &["HomeworkHelp".to_string()],
            Duration::from_secs(24 * 3600),
        )
        .await
        .unwrap();

    assert_eq!(report.tallies[0].written, 1);
    assert!(report.partial_failures.is_empty());
}

#[tokio::test]
async fn test_exhausted_forum_does_not_abort_others() {
    let (store, _dir) = setup_store().await;
    let server = MockServer::start().await;

    // AskAcademia is rate limited on every request
    Mock::given(method("GET"))
        .and(path("/r/AskAcademia/new.json"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/r/HomeworkHelp/new.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing(
            vec![post_child("ok1", "HomeworkHelp", 3600)],
            None,
        )))
        .mount(&server)
        .await;

    let config = test_config(&server.uri());
    let report = controller(&config, store.clone())
        .ingest(
            &["AskAcademia".to_string(), "HomeworkHelp".to_string()],
            Duration::from_secs(24 * 3600),
        )
        .await
        .unwrap();

    // The healthy forum's records are written and counted
    let homework = report
        .tallies
        .iter()
        .find(|t| t.forum == "HomeworkHelp")
        .unwrap();
    assert_eq!(homework.written, 1);

    // The exhausted forum is a partial failure, not a run failure
    assert_eq!(report.partial_failures.len(), 1);
    assert_eq!(report.partial_failures[0].scope, "ingest/AskAcademia");
    assert!(report.partial_failures[0]
        .reason
        .contains("retry budget"));

    assert_eq!(
        store.list("posts").await.unwrap(),
        vec!["posts/HomeworkHelp/ok1"]
    );
}

#[tokio::test]
async fn test_transport_errors_retried_then_degrade() {
    let (store, _dir) = setup_store().await;
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/r/HomeworkHelp/new.json"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let config = test_config(&server.uri());
    let report = controller(&config, store.clone())
        .ingest(
            &["HomeworkHelp".to_string()],
            Duration::from_secs(24 * 3600),
        )
        .await
        .unwrap();

    assert_eq!(report.tallies[0].written, 0);
    assert_eq!(report.partial_failures.len(), 1);
    assert!(report.partial_failures[0].reason.contains("status"));
}

#[tokio::test]
async fn test_cancelled_run_stops_promptly() {
    let (store, _dir) = setup_store().await;
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/r/HomeworkHelp/new.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing(
            vec![post_child("aaa", "HomeworkHelp", 3600)],
            None,
        )))
        .expect(0)
        .mount(&server)
        .await;

    let config = test_config(&server.uri());
    let client = RedditClient::new(&config).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let controller = IngestController::new(
        Arc::new(client),
        store.clone(),
        config.listing_backoff.clone(),
        config.ingest_concurrency,
        cancel,
    );

    let report = controller
        .ingest(
            &["HomeworkHelp".to_string()],
            Duration::from_secs(24 * 3600),
        )
        .await
        .unwrap();

    assert_eq!(report.total_written(), 0);
    assert!(store.list("posts").await.unwrap().is_empty());
}
