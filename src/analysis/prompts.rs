//! Instruction templates for each analysis kind.

use crate::analysis::AnalysisBatch;
use crate::store::models::AnalysisKind;

const TOPICS_INSTRUCTION: &str = "Identify the recurring topics across the forum posts below. \
Respond with a JSON object of the shape \
{\"topics\": [{\"label\": string, \"frequency\": integer, \"example_ids\": [string]}]} \
where frequency counts how many of these posts mention the topic and example_ids lists \
ids of posts (taken from the POST headers) that illustrate it. \
Order topics from most to least frequent.";

const PATTERNS_INSTRUCTION: &str = "Identify recurring behavioral or linguistic patterns in how \
the authors of the forum posts below express themselves (e.g. asking for reassurance, \
self-deprecation, deadline panic). Respond with a JSON object of the shape \
{\"patterns\": [{\"pattern\": string, \"frequency\": integer, \"examples\": [string]}]} \
where frequency counts matching posts and examples quotes short representative phrases. \
Order patterns from most to least frequent.";

const TRENDS_INSTRUCTION: &str = "Compute aggregate metrics over the forum posts below. \
Respond with a JSON object of the shape \
{\"metrics\": [{\"metric_name\": string, \"value\": number}]}. \
Always include a \"post_count\" metric with the number of posts, and an \"average_score\" \
metric with their mean score. Add further metrics only if clearly supported by the posts.";

const SUMMARY_INSTRUCTION: &str = "Summarize the forum posts below. Respond with a JSON object \
of the shape {\"narrative_text\": string, \"key_points\": [string]} where narrative_text is a \
short paragraph capturing what these posts are about and key_points lists the most important \
takeaways.";

const STRICT_SUFFIX: &str = "\n\nReturn exactly one JSON object and nothing else: no prose, \
no markdown, no code fences. The object must match the requested shape exactly.";

#[must_use]
pub fn instruction(kind: AnalysisKind) -> &'static str {
    match kind {
        AnalysisKind::Topics => TOPICS_INSTRUCTION,
        AnalysisKind::Patterns => PATTERNS_INSTRUCTION,
        AnalysisKind::Trends => TRENDS_INSTRUCTION,
        AnalysisKind::Summary => SUMMARY_INSTRUCTION,
    }
}

/// Build the full prompt for one batch.
///
/// Each record's body is truncated to `excerpt_chars` characters so a full
/// batch stays inside the model's input budget.
#[must_use]
pub fn batch_prompt(kind: AnalysisKind, batch: &AnalysisBatch, excerpt_chars: usize) -> String {
    let mut prompt = String::from(instruction(kind));
    prompt.push_str("\n\nPosts:\n");
    for record in &batch.records {
        prompt.push_str(&format!("### POST {}\n", record.id));
        prompt.push_str(&format!("forum: {}\n", record.forum));
        prompt.push_str(&format!("title: {}\n", truncate_chars(&record.title, 300)));
        prompt.push_str(&format!(
            "body: {}\n\n",
            truncate_chars(&record.body, excerpt_chars)
        ));
    }
    prompt
}

/// The stricter re-prompt used after a malformed response.
#[must_use]
pub fn stricter(prompt: &str) -> String {
    format!("{prompt}{STRICT_SUFFIX}")
}

/// Truncate on a character boundary, marking elided text.
fn truncate_chars(text: &str, budget: usize) -> String {
    if text.chars().count() <= budget {
        return text.to_string();
    }
    let mut out: String = text.chars().take(budget).collect();
    out.push_str("[...]");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{PostRecord, Scope};
    use chrono::{TimeZone, Utc};

    fn batch_with_body(body: &str) -> AnalysisBatch {
        let created = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        AnalysisBatch {
            scope: Scope {
                forum: None,
                start: created,
                end: created,
            },
            index: 0,
            records: vec![PostRecord {
                id: "abc123".to_string(),
                forum: "HomeworkHelp".to_string(),
                title: "Calc question".to_string(),
                author: "x".to_string(),
                body: body.to_string(),
                created_at: created,
                score: 1,
                num_comments: 0,
                url: String::new(),
                permalink: String::new(),
                upvote_ratio: None,
                fetched_at: created,
            }],
        }
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("abcdef", 3), "abc[...]");
        // Multi-byte characters are never split
        assert_eq!(truncate_chars("héllo", 2), "hé[...]");
    }

    #[test]
    fn test_batch_prompt_truncates_body() {
        let long_body = "x".repeat(500);
        let prompt = batch_prompt(AnalysisKind::Topics, &batch_with_body(&long_body), 100);
        assert!(prompt.contains("### POST abc123"));
        assert!(prompt.contains(&"x".repeat(100)));
        assert!(!prompt.contains(&"x".repeat(101)));
        assert!(prompt.contains("[...]"));
    }

    #[test]
    fn test_stricter_appends_suffix() {
        let strict = stricter("base");
        assert!(strict.starts_with("base"));
        assert!(strict.contains("no code fences"));
    }
}
