//! Parsing of per-batch model output and order-independent merging.
//!
//! Merge is associative and commutative over batch order: parts are sorted
//! into a canonical order before folding and every aggregate gets a final
//! canonical sort, so the serialized findings are byte-identical no matter
//! how batches were scheduled.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::store::models::{
    AnalysisKind, Findings, PatternFinding, Scope, SummaryFindings, TopicFinding, TrendPoint,
};

/// Cap on illustrative ids/quotes carried per merged finding.
const MAX_EXAMPLES: usize = 10;

#[derive(Debug, Error)]
#[error("model output did not match the {kind} shape: {message}")]
pub struct ParseError {
    pub kind: &'static str,
    pub message: String,
}

/// One aggregate metric reported by the model for one batch.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchMetric {
    pub metric_name: String,
    pub value: f64,
}

/// Findings parsed from a single batch's model response.
#[derive(Debug, Clone)]
pub enum PartialFindings {
    Topics(Vec<TopicFinding>),
    Patterns(Vec<PatternFinding>),
    Metrics(Vec<BatchMetric>),
    Summary(SummaryFindings),
}

/// A batch's parsed findings tagged with the batch's scope for merging.
#[derive(Debug, Clone)]
pub struct TaggedFindings {
    pub scope: Scope,
    pub index: usize,
    pub part: PartialFindings,
}

#[derive(Deserialize)]
struct TopicsPayload {
    topics: Vec<TopicFinding>,
}

#[derive(Deserialize)]
struct PatternsPayload {
    patterns: Vec<PatternFinding>,
}

#[derive(Deserialize)]
struct MetricsPayload {
    metrics: Vec<BatchMetric>,
}

/// Parse raw model text against the expected shape for `kind`.
///
/// Tolerates prose or code fences around the JSON object, since models add
/// them despite instructions.
///
/// # Errors
///
/// Returns an error if no JSON object is present or it does not match the
/// expected shape.
pub fn parse_part(kind: AnalysisKind, raw: &str) -> Result<PartialFindings, ParseError> {
    let json = extract_json_object(raw).ok_or_else(|| ParseError {
        kind: kind.as_str(),
        message: "no JSON object found in response".to_string(),
    })?;

    let mismatch = |e: serde_json::Error| ParseError {
        kind: kind.as_str(),
        message: e.to_string(),
    };

    match kind {
        AnalysisKind::Topics => {
            let payload: TopicsPayload = serde_json::from_str(json).map_err(mismatch)?;
            Ok(PartialFindings::Topics(payload.topics))
        }
        AnalysisKind::Patterns => {
            let payload: PatternsPayload = serde_json::from_str(json).map_err(mismatch)?;
            Ok(PartialFindings::Patterns(payload.patterns))
        }
        AnalysisKind::Trends => {
            let payload: MetricsPayload = serde_json::from_str(json).map_err(mismatch)?;
            Ok(PartialFindings::Metrics(payload.metrics))
        }
        AnalysisKind::Summary => {
            let summary: SummaryFindings = serde_json::from_str(json).map_err(mismatch)?;
            Ok(PartialFindings::Summary(summary))
        }
    }
}

/// The outermost `{...}` span of the text, if any.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Fold all parsed batches into one findings payload.
#[must_use]
pub fn merge(kind: AnalysisKind, mut parts: Vec<TaggedFindings>) -> Findings {
    // Canonical fold order: scheduling order must not leak into the output.
    parts.sort_by(|a, b| {
        (a.scope.start, &a.scope.forum, a.index).cmp(&(b.scope.start, &b.scope.forum, b.index))
    });

    match kind {
        AnalysisKind::Topics => merge_topics(parts),
        AnalysisKind::Patterns => merge_patterns(parts),
        AnalysisKind::Trends => merge_trends(parts),
        AnalysisKind::Summary => merge_summaries(parts),
    }
}

fn merge_topics(parts: Vec<TaggedFindings>) -> Findings {
    let mut by_label: BTreeMap<String, TopicFinding> = BTreeMap::new();
    for tagged in parts {
        let PartialFindings::Topics(topics) = tagged.part else {
            continue;
        };
        for topic in topics {
            let entry = by_label
                .entry(topic.label.clone())
                .or_insert_with(|| TopicFinding {
                    label: topic.label.clone(),
                    frequency: 0,
                    example_ids: Vec::new(),
                });
            entry.frequency += topic.frequency;
            extend_examples(&mut entry.example_ids, topic.example_ids);
        }
    }
    let mut merged: Vec<TopicFinding> = by_label.into_values().collect();
    merged.sort_by(|a, b| (Reverse(a.frequency), &a.label).cmp(&(Reverse(b.frequency), &b.label)));
    Findings::Topics(merged)
}

fn merge_patterns(parts: Vec<TaggedFindings>) -> Findings {
    let mut by_pattern: BTreeMap<String, PatternFinding> = BTreeMap::new();
    for tagged in parts {
        let PartialFindings::Patterns(patterns) = tagged.part else {
            continue;
        };
        for pattern in patterns {
            let entry =
                by_pattern
                    .entry(pattern.pattern.clone())
                    .or_insert_with(|| PatternFinding {
                        pattern: pattern.pattern.clone(),
                        frequency: 0,
                        examples: Vec::new(),
                    });
            entry.frequency += pattern.frequency;
            extend_examples(&mut entry.examples, pattern.examples);
        }
    }
    let mut merged: Vec<PatternFinding> = by_pattern.into_values().collect();
    merged.sort_by(|a, b| {
        (Reverse(a.frequency), &a.pattern).cmp(&(Reverse(b.frequency), &b.pattern))
    });
    Findings::Patterns(merged)
}

fn merge_trends(parts: Vec<TaggedFindings>) -> Findings {
    // Spill batches share a scope, so values for the same (interval, metric)
    // sum; the BTreeMap keeps the series sorted by interval then metric.
    let mut by_key: BTreeMap<(DateTime<Utc>, String), TrendPoint> = BTreeMap::new();
    for tagged in parts {
        let PartialFindings::Metrics(metrics) = tagged.part else {
            continue;
        };
        for metric in metrics {
            by_key
                .entry((tagged.scope.start, metric.metric_name.clone()))
                .and_modify(|point| point.value += metric.value)
                .or_insert_with(|| TrendPoint {
                    interval_start: tagged.scope.start,
                    interval_end: tagged.scope.end,
                    metric_name: metric.metric_name.clone(),
                    value: metric.value,
                });
        }
    }
    Findings::Trends(by_key.into_values().collect())
}

fn merge_summaries(parts: Vec<TaggedFindings>) -> Findings {
    let mut sections = Vec::new();
    let mut key_points = Vec::new();
    for tagged in parts {
        let PartialFindings::Summary(summary) = tagged.part else {
            continue;
        };
        if !summary.narrative_text.is_empty() {
            sections.push(format!(
                "[{} batch {}] {}",
                tagged.scope.label(),
                tagged.index,
                summary.narrative_text
            ));
        }
        for point in summary.key_points {
            if !key_points.contains(&point) {
                key_points.push(point);
            }
        }
    }
    Findings::Summary(SummaryFindings {
        narrative_text: sections.join("\n\n"),
        key_points,
    })
}

fn extend_examples(existing: &mut Vec<String>, new: Vec<String>) {
    for example in new {
        if existing.len() >= MAX_EXAMPLES {
            break;
        }
        if !existing.contains(&example) {
            existing.push(example);
        }
    }
}
