//! Wire types for the Reddit JSON listing API.
//!
//! Raw entries are only ever inspected at the ingestion boundary, where they
//! are normalized into [`crate::store::models::PostRecord`].

use serde::Deserialize;

/// Listing entry kind for posts. Comments are `t1`.
pub const POST_KIND: &str = "t3";

/// Top-level listing envelope returned by `/r/<forum>/new.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct Listing {
    pub kind: String,
    pub data: ListingData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingData {
    #[serde(default)]
    pub children: Vec<Thing>,
    /// Pagination cursor for the next (older) page; absent on the last page.
    #[serde(default)]
    pub after: Option<String>,
}

/// A kind-tagged listing child.
#[derive(Debug, Clone, Deserialize)]
pub struct Thing {
    pub kind: String,
    pub data: RawEntry,
}

/// Untyped post entry as the listing API serves it.
///
/// Fields the API sometimes omits (deleted authors, crossposts without
/// bodies) default rather than failing the whole page.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEntry {
    pub id: String,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub created_utc: f64,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub num_comments: i64,
    #[serde(default)]
    pub selftext: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub upvote_ratio: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING_FIXTURE: &str = r#"{
        "kind": "Listing",
        "data": {
            "after": "t3_cursor1",
            "children": [
                {
                    "kind": "t3",
                    "data": {
                        "id": "1abcd",
                        "subreddit": "HomeworkHelp",
                        "title": "Stuck on trigonometry",
                        "author": "student42",
                        "created_utc": 1704103200.0,
                        "score": 12,
                        "num_comments": 4,
                        "selftext": "I can't figure out this identity...",
                        "url": "https://www.reddit.com/r/HomeworkHelp/comments/1abcd/",
                        "permalink": "/r/HomeworkHelp/comments/1abcd/",
                        "upvote_ratio": 0.93
                    }
                },
                {
                    "kind": "t1",
                    "data": { "id": "c1", "created_utc": 1704103300.0 }
                }
            ]
        }
    }"#;

    #[test]
    fn test_deserialize_listing() {
        let listing: Listing = serde_json::from_str(LISTING_FIXTURE).unwrap();
        assert_eq!(listing.kind, "Listing");
        assert_eq!(listing.data.after.as_deref(), Some("t3_cursor1"));
        assert_eq!(listing.data.children.len(), 2);

        let post = &listing.data.children[0];
        assert_eq!(post.kind, POST_KIND);
        assert_eq!(post.data.id, "1abcd");
        assert_eq!(post.data.author.as_deref(), Some("student42"));
        assert_eq!(post.data.upvote_ratio, Some(0.93));

        let comment = &listing.data.children[1];
        assert_ne!(comment.kind, POST_KIND);
        // Missing fields default instead of failing the page
        assert_eq!(comment.data.title, "");
        assert_eq!(comment.data.author, None);
    }

    #[test]
    fn test_deserialize_terminal_page() {
        let listing: Listing =
            serde_json::from_str(r#"{"kind":"Listing","data":{"children":[],"after":null}}"#)
                .unwrap();
        assert!(listing.data.children.is_empty());
        assert_eq!(listing.data.after, None);
    }
}
