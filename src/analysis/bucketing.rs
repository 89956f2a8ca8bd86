//! Timeframe resolution and batch planning.
//!
//! A timeframe specifier (relative like `last-3-months`, or calendar-aligned
//! like `2024-q1`) resolves to concrete UTC intervals. Matching records are
//! loaded from the store, sorted for determinism, and partitioned into
//! capped batches per interval.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Utc};
use thiserror::Error;
use tracing::debug;

use crate::analysis::AnalysisBatch;
use crate::store::models::{AnalysisKind, PostRecord, Scope};
use crate::store::{posts_prefix, RecordStore, StoreError};

#[derive(Debug, Clone, Error)]
#[error("invalid timeframe '{input}': {message}")]
pub struct TimeframeError {
    input: String,
    message: String,
}

impl TimeframeError {
    fn new(input: &str, message: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            message: message.into(),
        }
    }
}

/// A user-facing timeframe specifier, not yet anchored to a clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeframeSpec {
    LastDays(u32),
    LastMonths(u32),
    Month { year: i32, month: u32 },
    Quarter { year: i32, quarter: u32 },
    Year(i32),
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl TimeframeSpec {
    /// Resolve to a concrete `[start, end)` interval.
    ///
    /// # Errors
    ///
    /// Returns an error if the specifier produces an unrepresentable date.
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>), TimeframeError> {
        match *self {
            Self::LastDays(days) => Ok((now - chrono::Duration::days(i64::from(days)), now)),
            Self::LastMonths(months) => {
                let start = now
                    .checked_sub_months(Months::new(months))
                    .ok_or_else(|| TimeframeError::new("last-months", "month underflow"))?;
                Ok((start, now))
            }
            Self::Month { year, month } => {
                let start = month_start(year, month)?;
                let end = start
                    .checked_add_months(Months::new(1))
                    .ok_or_else(|| TimeframeError::new("month", "month overflow"))?;
                Ok((start, end))
            }
            Self::Quarter { year, quarter } => {
                let start = month_start(year, (quarter - 1) * 3 + 1)?;
                let end = start
                    .checked_add_months(Months::new(3))
                    .ok_or_else(|| TimeframeError::new("quarter", "month overflow"))?;
                Ok((start, end))
            }
            Self::Year(year) => Ok((month_start(year, 1)?, month_start(year + 1, 1)?)),
            Self::Range { start, end } => Ok((start, end)),
        }
    }
}

impl FromStr for TimeframeSpec {
    type Err = TimeframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().to_ascii_lowercase();

        if let Some(rest) = raw.strip_prefix("last-") {
            let (count, unit) = rest
                .rsplit_once('-')
                .ok_or_else(|| TimeframeError::new(s, "expected last-<n>-days or last-<n>-months"))?;
            let n: u32 = count
                .parse()
                .map_err(|_| TimeframeError::new(s, "count must be a positive integer"))?;
            if n == 0 {
                return Err(TimeframeError::new(s, "count must be at least 1"));
            }
            return match unit {
                "day" | "days" => Ok(Self::LastDays(n)),
                "month" | "months" => Ok(Self::LastMonths(n)),
                _ => Err(TimeframeError::new(s, "unit must be days or months")),
            };
        }

        if let Some((from, to)) = raw.split_once("..") {
            let start = parse_date(s, from)?;
            let end = parse_date(s, to)?;
            if start >= end {
                return Err(TimeframeError::new(s, "range start must precede end"));
            }
            return Ok(Self::Range { start, end });
        }

        match raw.split_once('-') {
            None => {
                let year: i32 = raw
                    .parse()
                    .map_err(|_| TimeframeError::new(s, "expected a 4-digit year"))?;
                Ok(Self::Year(year))
            }
            Some((year_raw, rest)) => {
                let year: i32 = year_raw
                    .parse()
                    .map_err(|_| TimeframeError::new(s, "expected a 4-digit year"))?;
                if let Some(quarter_raw) = rest.strip_prefix('q') {
                    let quarter: u32 = quarter_raw
                        .parse()
                        .map_err(|_| TimeframeError::new(s, "quarter must be 1-4"))?;
                    if !(1..=4).contains(&quarter) {
                        return Err(TimeframeError::new(s, "quarter must be 1-4"));
                    }
                    Ok(Self::Quarter { year, quarter })
                } else {
                    let month: u32 = rest
                        .parse()
                        .map_err(|_| TimeframeError::new(s, "month must be 1-12"))?;
                    if !(1..=12).contains(&month) {
                        return Err(TimeframeError::new(s, "month must be 1-12"));
                    }
                    Ok(Self::Month { year, month })
                }
            }
        }
    }
}

fn parse_date(input: &str, raw: &str) -> Result<DateTime<Utc>, TimeframeError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| d.and_time(chrono::NaiveTime::MIN).and_utc())
        .map_err(|_| TimeframeError::new(input, "dates must be YYYY-MM-DD"))
}

fn month_start(year: i32, month: u32) -> Result<DateTime<Utc>, TimeframeError> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| TimeframeError::new("calendar", format!("invalid month {year}-{month:02}")))
}

/// How the resolved interval is subdivided into batch scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// One scope covering the whole interval.
    Single,
    /// Calendar-aligned monthly sub-intervals, clipped to the interval.
    Monthly,
}

impl Granularity {
    /// Trend analysis implies periodic bucketing; everything else runs over
    /// a single merged scope.
    #[must_use]
    pub fn for_kind(kind: AnalysisKind) -> Self {
        match kind {
            AnalysisKind::Trends => Self::Monthly,
            _ => Self::Single,
        }
    }
}

/// Split `[start, end)` at calendar month boundaries.
#[must_use]
pub fn monthly_intervals(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut intervals = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let Some(floor) = Utc
            .with_ymd_and_hms(cursor.year(), cursor.month(), 1, 0, 0, 0)
            .single()
        else {
            break;
        };
        let Some(next) = floor.checked_add_months(Months::new(1)) else {
            break;
        };
        intervals.push((cursor, next.min(end)));
        cursor = next;
    }
    intervals
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Timeframe(#[from] TimeframeError),
}

/// The overall run scope plus the batches partitioning it.
#[derive(Debug, Clone)]
pub struct Plan {
    pub scope: Scope,
    pub batches: Vec<AnalysisBatch>,
}

/// Selects records from the store and partitions them into analysis batches.
pub struct BucketPlanner {
    store: RecordStore,
    max_batch_records: usize,
}

impl BucketPlanner {
    #[must_use]
    pub fn new(store: RecordStore, max_batch_records: usize) -> Self {
        Self {
            store,
            max_batch_records: max_batch_records.max(1),
        }
    }

    /// Build the batch plan for a forum filter and timeframe.
    ///
    /// An empty store or a timeframe with no matching records yields a valid
    /// plan with zero batches.
    ///
    /// # Errors
    ///
    /// Returns an error if the timeframe cannot be resolved or the store
    /// fails.
    pub async fn plan(
        &self,
        forum: Option<&str>,
        timeframe: &TimeframeSpec,
        granularity: Granularity,
        now: DateTime<Utc>,
    ) -> Result<Plan, PlanError> {
        let (start, end) = timeframe.resolve(now)?;
        let scope = Scope {
            forum: forum.map(ToString::to_string),
            start,
            end,
        };

        let intervals = match granularity {
            Granularity::Single => vec![(start, end)],
            Granularity::Monthly => monthly_intervals(start, end),
        };

        let mut records = Vec::new();
        for key in self.store.list(&posts_prefix(forum)).await? {
            let Some(record) = self.store.get::<PostRecord>(&key).await? else {
                continue;
            };
            if record.created_at >= start && record.created_at < end {
                records.push(record);
            }
        }
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let batches = partition(&records, &intervals, forum, self.max_batch_records);
        debug!(
            scope = %scope.label(),
            records = records.len(),
            batches = batches.len(),
            "Built analysis plan"
        );

        Ok(Plan { scope, batches })
    }
}

/// Partition sorted records into capped batches, one scope per interval.
fn partition(
    records: &[PostRecord],
    intervals: &[(DateTime<Utc>, DateTime<Utc>)],
    forum: Option<&str>,
    cap: usize,
) -> Vec<AnalysisBatch> {
    let mut batches = Vec::new();
    for &(start, end) in intervals {
        let in_interval: Vec<&PostRecord> = records
            .iter()
            .filter(|r| r.created_at >= start && r.created_at < end)
            .collect();
        if in_interval.is_empty() {
            continue;
        }
        let scope = Scope {
            forum: forum.map(ToString::to_string),
            start,
            end,
        };
        for (index, chunk) in in_interval.chunks(cap).enumerate() {
            batches.push(AnalysisBatch {
                scope: scope.clone(),
                index,
                records: chunk.iter().map(|&r| r.clone()).collect(),
            });
        }
    }
    batches
}
