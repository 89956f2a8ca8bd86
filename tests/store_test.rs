//! Integration tests for the file-backed record store.

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use subreddit_insights::store::models::PostRecord;
use subreddit_insights::store::{post_key, PutOutcome, RecordStore, StoreError};

async fn setup_store() -> (RecordStore, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = RecordStore::open(temp_dir.path())
        .await
        .expect("Failed to open store");
    (store, temp_dir)
}

fn sample_record(id: &str) -> PostRecord {
    PostRecord {
        id: id.to_string(),
        forum: "HomeworkHelp".to_string(),
        title: "Stuck on integrals".to_string(),
        author: "student42".to_string(),
        body: "I keep getting the wrong sign...".to_string(),
        created_at: Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap(),
        score: 7,
        num_comments: 3,
        url: "https://www.reddit.com/r/HomeworkHelp/comments/abc/".to_string(),
        permalink: "/r/HomeworkHelp/comments/abc/".to_string(),
        upvote_ratio: Some(0.88),
        fetched_at: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
    }
}

#[tokio::test]
async fn test_put_get_roundtrip() {
    let (store, _dir) = setup_store().await;
    let record = sample_record("abc");
    let key = post_key(&record.forum, &record.id);

    let outcome = store.put(&key, &record).await.unwrap();
    assert_eq!(outcome, PutOutcome::Written);

    let loaded: PostRecord = store.get(&key).await.unwrap().expect("record missing");
    assert_eq!(loaded, record);
}

#[tokio::test]
async fn test_get_missing_is_none() {
    let (store, _dir) = setup_store().await;
    let missing: Option<PostRecord> = store.get("posts/HomeworkHelp/nope").await.unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_put_is_idempotent() {
    let (store, _dir) = setup_store().await;
    let record = sample_record("abc");
    let key = post_key(&record.forum, &record.id);

    assert_eq!(store.put(&key, &record).await.unwrap(), PutOutcome::Written);
    // Identical content is a no-op
    assert_eq!(
        store.put(&key, &record).await.unwrap(),
        PutOutcome::Unchanged
    );

    // Different content overwrites (last-write-wins)
    let mut updated = record;
    updated.score = 99;
    assert_eq!(
        store.put(&key, &updated).await.unwrap(),
        PutOutcome::Overwritten
    );
    let loaded: PostRecord = store.get(&key).await.unwrap().unwrap();
    assert_eq!(loaded.score, 99);
}

#[tokio::test]
async fn test_list_by_prefix_sorted() {
    let (store, _dir) = setup_store().await;
    for (forum, id) in [
        ("Student", "b2"),
        ("HomeworkHelp", "a1"),
        ("HomeworkHelp", "a3"),
    ] {
        let mut record = sample_record(id);
        record.forum = forum.to_string();
        store
            .put(&post_key(forum, id), &record)
            .await
            .unwrap();
    }

    let all = store.list("posts").await.unwrap();
    assert_eq!(
        all,
        vec![
            "posts/HomeworkHelp/a1",
            "posts/HomeworkHelp/a3",
            "posts/Student/b2",
        ]
    );

    let scoped = store.list("posts/Student").await.unwrap();
    assert_eq!(scoped, vec!["posts/Student/b2"]);

    // A prefix that matches nothing is an empty list, not an error
    assert!(store.list("posts/AskAcademia").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_key_rejected() {
    let (store, _dir) = setup_store().await;
    let record = sample_record("abc");
    let err = store.put("posts/../escape", &record).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidKey(_)));
}

#[tokio::test]
async fn test_open_unavailable_root() {
    let temp_dir = TempDir::new().unwrap();
    let blocker = temp_dir.path().join("blocker");
    tokio::fs::write(&blocker, b"not a directory").await.unwrap();

    // Rooting the store under a regular file cannot work
    let err = RecordStore::open(&blocker.join("sub")).await.unwrap_err();
    assert!(matches!(err, StoreError::Unavailable { .. }));
}
