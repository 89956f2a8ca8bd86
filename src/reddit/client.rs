use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::reddit::models::{Listing, Thing};

/// User agent for listing requests. Reddit throttles unidentified clients
/// aggressively.
const LISTING_USER_AGENT: &str = "subreddit-insights/0.1 (post harvester)";

#[derive(Debug, Error)]
pub enum ListError {
    #[error("rate limited by listing API")]
    RateLimited { retry_after: Option<Duration> },
    #[error("listing transport failure: {0}")]
    Transport(String),
    #[error("malformed listing response: {0}")]
    Malformed(String),
}

/// One page of listing entries plus the cursor to the next (older) page.
#[derive(Debug, Clone)]
pub struct Page {
    pub entries: Vec<Thing>,
    pub next_cursor: Option<String>,
}

/// Paginated, newest-first access to a forum's post listing.
#[async_trait]
pub trait ListingClient: Send + Sync {
    /// Fetch one page. `cursor` of `None` requests the newest page; a
    /// returned `next_cursor` of `None` signals the end of the listing.
    async fn list_page(&self, forum: &str, cursor: Option<&str>) -> Result<Page, ListError>;
}

/// HTTP client for the public Reddit JSON listing API.
#[derive(Debug, Clone)]
pub struct RedditClient {
    http: reqwest::Client,
    base_url: String,
    page_size: u32,
}

impl RedditClient {
    /// Build a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be constructed.
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(LISTING_USER_AGENT)
            .build()
            .context("Failed to build listing HTTP client")?;

        Ok(Self {
            http,
            base_url: config.reddit_base_url.trim_end_matches('/').to_string(),
            page_size: config.page_size,
        })
    }

    fn page_url(&self, forum: &str, cursor: Option<&str>) -> String {
        let mut url = format!(
            "{}/r/{}/new.json?limit={}&raw_json=1",
            self.base_url, forum, self.page_size
        );
        if let Some(after) = cursor {
            url.push_str("&after=");
            url.push_str(after);
        }
        url
    }
}

#[async_trait]
impl ListingClient for RedditClient {
    async fn list_page(&self, forum: &str, cursor: Option<&str>) -> Result<Page, ListError> {
        let url = self.page_url(forum, cursor);
        debug!(forum, cursor = cursor.unwrap_or("<start>"), "Fetching listing page");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ListError::Transport(format!("{e:#}")))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ListError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(ListError::Transport(format!(
                "listing request for r/{forum} returned status {status}"
            )));
        }

        let listing: Listing = response
            .json()
            .await
            .map_err(|e| ListError::Malformed(format!("{e:#}")))?;

        Ok(Page {
            entries: listing.data.children,
            next_cursor: listing.data.after.filter(|c| !c.is_empty()),
        })
    }
}
