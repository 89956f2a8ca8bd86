//! Ingestion controller.
//!
//! Walks each configured forum's paginated listing newest-first, stops at
//! the time-window boundary, normalizes entries, and writes one record per
//! newly seen post. Rate limits and transport errors are retried with capped
//! exponential backoff; an exhausted retry budget fails only that forum.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BackoffPolicy;
use crate::reddit::models::{RawEntry, POST_KIND};
use crate::reddit::{ListError, ListingClient};
use crate::store::models::{PartialFailure, PostRecord};
use crate::store::{post_key, RecordStore, StoreError};

/// Link targets the original harvester never stored.
const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif"];

/// Per-forum ingestion counters.
#[derive(Debug, Clone, Default)]
pub struct ForumTally {
    pub forum: String,
    pub written: u64,
    pub duplicates: u64,
    pub skipped_non_posts: u64,
    pub skipped_images: u64,
}

/// Result of one ingestion run across all requested forums.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub tallies: Vec<ForumTally>,
    pub partial_failures: Vec<PartialFailure>,
}

impl IngestReport {
    #[must_use]
    pub fn total_written(&self) -> u64 {
        self.tallies.iter().map(|t| t.written).sum()
    }
}

/// Drives the listing client and writes normalized post records.
pub struct IngestController {
    client: Arc<dyn ListingClient>,
    store: RecordStore,
    backoff: BackoffPolicy,
    concurrency: usize,
    cancel: CancellationToken,
}

impl IngestController {
    #[must_use]
    pub fn new(
        client: Arc<dyn ListingClient>,
        store: RecordStore,
        backoff: BackoffPolicy,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            store,
            backoff,
            concurrency: concurrency.max(1),
            cancel,
        }
    }

    /// Ingest every forum's posts newer than `now - window`.
    ///
    /// Forums are processed independently; one forum exhausting its retry
    /// budget is recorded as a partial failure without touching the others.
    ///
    /// # Errors
    ///
    /// Returns an error only if the record store itself fails; everything
    /// else degrades to entries in `partial_failures`.
    pub async fn ingest(&self, forums: &[String], window: Duration) -> Result<IngestReport> {
        let cutoff = Utc::now() - chrono::Duration::seconds(window.as_secs() as i64);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        let mut handles = Vec::new();
        for forum in forums {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("Ingest semaphore closed")?;
            let job = ForumJob {
                client: Arc::clone(&self.client),
                store: self.store.clone(),
                backoff: self.backoff.clone(),
                cancel: self.cancel.clone(),
                forum: forum.clone(),
                cutoff,
            };
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                job.run().await
            }));
        }

        let mut report = IngestReport::default();
        for (forum, handle) in forums.iter().zip(handles) {
            match handle.await {
                Ok(Ok((tally, failure))) => {
                    info!(
                        forum = %tally.forum,
                        written = tally.written,
                        duplicates = tally.duplicates,
                        skipped_non_posts = tally.skipped_non_posts,
                        skipped_images = tally.skipped_images,
                        failed = failure.is_some(),
                        "Forum ingestion finished"
                    );
                    report.tallies.push(tally);
                    report.partial_failures.extend(failure);
                }
                Ok(Err(store_err)) => {
                    return Err(store_err).context("Record store failed during ingestion")
                }
                Err(e) => {
                    warn!(forum = %forum, "Ingest task panicked: {e}");
                    report.partial_failures.push(PartialFailure {
                        scope: format!("ingest/{forum}"),
                        reason: format!("ingest task panicked: {e}"),
                    });
                }
            }
        }

        Ok(report)
    }
}

/// One forum's pagination loop, run as an independent task.
struct ForumJob {
    client: Arc<dyn ListingClient>,
    store: RecordStore,
    backoff: BackoffPolicy,
    cancel: CancellationToken,
    forum: String,
    cutoff: DateTime<Utc>,
}

impl ForumJob {
    async fn run(self) -> Result<(ForumTally, Option<PartialFailure>), StoreError> {
        let mut tally = ForumTally {
            forum: self.forum.clone(),
            ..ForumTally::default()
        };

        let mut cursor: Option<String> = None;
        let mut attempts = 0u32;

        'pages: loop {
            if self.cancel.is_cancelled() {
                debug!(forum = %self.forum, "Ingestion cancelled, stopping pagination");
                break;
            }

            match self.client.list_page(&self.forum, cursor.as_deref()).await {
                Ok(page) => {
                    attempts = 0;
                    for thing in page.entries {
                        if thing.kind != POST_KIND {
                            tally.skipped_non_posts += 1;
                            continue;
                        }
                        let fetched_at = Utc::now();
                        let Some(record) = normalize_entry(&self.forum, thing.data, fetched_at)
                        else {
                            tally.skipped_non_posts += 1;
                            continue;
                        };
                        // Listing is newest-first: the first entry past the
                        // window ends this forum's walk.
                        if record.created_at < self.cutoff {
                            break 'pages;
                        }
                        if is_image_post(&record.url) {
                            tally.skipped_images += 1;
                            continue;
                        }
                        let key = post_key(&record.forum, &record.id);
                        if self.store.contains(&key).await? {
                            tally.duplicates += 1;
                            continue;
                        }
                        self.store.put(&key, &record).await?;
                        tally.written += 1;
                    }

                    match page.next_cursor {
                        Some(next) => cursor = Some(next),
                        None => break,
                    }
                }
                Err(ListError::RateLimited { retry_after }) => {
                    attempts += 1;
                    if attempts > self.backoff.max_retries {
                        return Ok((
                            tally,
                            Some(self.failure(format!(
                                "rate limit retry budget ({}) exhausted",
                                self.backoff.max_retries
                            ))),
                        ));
                    }
                    let delay = retry_after.unwrap_or_else(|| self.backoff.delay_for(attempts));
                    warn!(
                        forum = %self.forum,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    if !self.pause(delay).await {
                        break;
                    }
                }
                Err(e @ (ListError::Transport(_) | ListError::Malformed(_))) => {
                    attempts += 1;
                    if attempts > self.backoff.max_retries {
                        return Ok((tally, Some(self.failure(format!("{e}")))));
                    }
                    let delay = self.backoff.delay_for(attempts);
                    warn!(
                        forum = %self.forum,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Listing request failed, backing off: {e}"
                    );
                    if !self.pause(delay).await {
                        break;
                    }
                }
            }
        }

        Ok((tally, None))
    }

    /// Sleep for a jittered delay; returns false if cancelled meanwhile.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(jittered(delay)) => true,
        }
    }

    fn failure(&self, reason: String) -> PartialFailure {
        PartialFailure {
            scope: format!("ingest/{}", self.forum),
            reason,
        }
    }
}

/// Normalize a raw listing entry into the fixed record shape.
///
/// Returns `None` for entries without a usable id or creation time.
#[must_use]
pub fn normalize_entry(
    requested_forum: &str,
    raw: RawEntry,
    fetched_at: DateTime<Utc>,
) -> Option<PostRecord> {
    if raw.id.is_empty() {
        return None;
    }
    let created_at = DateTime::from_timestamp(raw.created_utc as i64, 0)?;
    let forum = if raw.subreddit.is_empty() {
        requested_forum.to_string()
    } else {
        raw.subreddit
    };
    Some(PostRecord {
        id: raw.id,
        forum,
        title: raw.title,
        author: raw.author.unwrap_or_else(|| "[deleted]".to_string()),
        body: raw.selftext,
        created_at,
        score: raw.score,
        num_comments: raw.num_comments,
        url: raw.url,
        permalink: raw.permalink,
        upvote_ratio: raw.upvote_ratio,
        fetched_at,
    })
}

fn is_image_post(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Add up to 25% random jitter so parallel loops don't retry in lockstep.
fn jittered(delay: Duration) -> Duration {
    let quarter = delay.as_millis() as u64 / 4;
    if quarter == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=quarter))
}
