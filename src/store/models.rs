use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A harvested subreddit post, immutable once written.
///
/// `(forum, id)` is the primary key; re-ingesting the same pair is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: String,
    pub forum: String,
    pub title: String,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub score: i64,
    pub num_comments: i64,
    pub url: String,
    pub permalink: String,
    pub upvote_ratio: Option<f64>,
    pub fetched_at: DateTime<Utc>,
}

/// The forum filter and time interval an analysis ran over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub forum: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Scope {
    /// Human-readable label used in logs and partial-failure entries.
    #[must_use]
    pub fn label(&self) -> String {
        format!(
            "{}/{}..{}",
            self.forum.as_deref().unwrap_or("all"),
            self.start.format("%Y-%m-%dT%H:%M:%SZ"),
            self.end.format("%Y-%m-%dT%H:%M:%SZ"),
        )
    }
}

/// The kind of aggregate an analysis run produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisKind {
    Topics,
    Patterns,
    Trends,
    Summary,
}

impl AnalysisKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Topics => "topics",
            Self::Patterns => "patterns",
            Self::Trends => "trends",
            Self::Summary => "summary",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "topics" => Some(Self::Topics),
            "patterns" => Some(Self::Patterns),
            "trends" => Some(Self::Trends),
            "summary" => Some(Self::Summary),
            _ => None,
        }
    }
}

/// One recurring topic across a scope's posts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicFinding {
    pub label: String,
    pub frequency: u64,
    pub example_ids: Vec<String>,
}

/// One recurring behavioral or linguistic pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternFinding {
    pub pattern: String,
    pub frequency: u64,
    pub examples: Vec<String>,
}

/// One metric value for one time interval of a trend series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub interval_start: DateTime<Utc>,
    pub interval_end: DateTime<Utc>,
    pub metric_name: String,
    pub value: f64,
}

/// Narrative summary of a scope's posts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryFindings {
    pub narrative_text: String,
    pub key_points: Vec<String>,
}

/// Analysis-type-specific findings payload.
///
/// Serialized untagged: the report's `analysis_type` field identifies the
/// shape, matching the persisted report format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Findings {
    Topics(Vec<TopicFinding>),
    Patterns(Vec<PatternFinding>),
    Trends(Vec<TrendPoint>),
    Summary(SummaryFindings),
}

impl Findings {
    /// The empty findings payload for a kind, used when no batch parsed.
    #[must_use]
    pub fn empty(kind: AnalysisKind) -> Self {
        match kind {
            AnalysisKind::Topics => Self::Topics(Vec::new()),
            AnalysisKind::Patterns => Self::Patterns(Vec::new()),
            AnalysisKind::Trends => Self::Trends(Vec::new()),
            AnalysisKind::Summary => Self::Summary(SummaryFindings::default()),
        }
    }

    /// Whether the payload carries no findings at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Topics(t) => t.is_empty(),
            Self::Patterns(p) => p.is_empty(),
            Self::Trends(t) => t.is_empty(),
            Self::Summary(s) => s.narrative_text.is_empty() && s.key_points.is_empty(),
        }
    }
}

/// A scoped failure that did not abort the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFailure {
    pub scope: String,
    pub reason: String,
}

/// A persisted analysis report. Re-running the same scope overwrites it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub analysis_type: AnalysisKind,
    pub scope: Scope,
    pub generated_at: DateTime<Utc>,
    pub findings: Findings,
    pub partial_failures: Vec<PartialFailure>,
}
