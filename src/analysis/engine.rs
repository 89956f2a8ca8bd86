//! Analysis engine.
//!
//! Each batch moves through pending -> requested -> parsed | failed. A
//! transport failure is retried with backoff up to `max_attempts`; a
//! malformed response gets exactly one stricter re-prompt. Failed batches
//! become partial failures on the report; they never abort the run.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analysis::merge::{self, TaggedFindings};
use crate::analysis::{prompts, AnalysisBatch};
use crate::config::{BackoffPolicy, Config};
use crate::model::CompletionClient;
use crate::store::models::{AnalysisKind, AnalysisReport, Findings, PartialFailure, Scope};

/// Tuning for the analysis engine, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub concurrency: usize,
    pub max_tokens: u32,
    pub excerpt_chars: usize,
}

impl EngineSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.batch_max_attempts,
            backoff: config.model_backoff.clone(),
            concurrency: config.analysis_concurrency.max(1),
            max_tokens: config.model_max_tokens,
            excerpt_chars: config.record_excerpt_chars,
        }
    }
}

/// Outcome of one batch's walk through the state machine.
enum BatchOutcome {
    Parsed(TaggedFindings),
    Failed(PartialFailure),
}

/// Runs batches against the model and folds findings into one report.
pub struct AnalysisEngine {
    model: Arc<dyn CompletionClient>,
    settings: EngineSettings,
    cancel: CancellationToken,
}

impl AnalysisEngine {
    #[must_use]
    pub fn new(
        model: Arc<dyn CompletionClient>,
        settings: EngineSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            model,
            settings,
            cancel,
        }
    }

    /// Analyze all batches and merge the parsed findings into one report.
    ///
    /// Zero batches produce a report with empty findings. A run where every
    /// batch fails produces a report with empty findings and the failures
    /// listed, not an error.
    pub async fn analyze(
        &self,
        kind: AnalysisKind,
        scope: Scope,
        batches: Vec<AnalysisBatch>,
    ) -> AnalysisReport {
        let total = batches.len();
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut handles = Vec::new();
        let mut failures = Vec::new();

        for batch in batches {
            // Stop issuing new batch requests once cancelled; in-flight
            // tasks run to completion so partial findings survive.
            if self.cancel.is_cancelled() {
                failures.push(PartialFailure {
                    scope: batch.label(),
                    reason: "cancelled before request".to_string(),
                });
                continue;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("Semaphore closed unexpectedly");
            let model = Arc::clone(&self.model);
            let settings = self.settings.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                process_batch(model, settings, cancel, kind, batch).await
            }));
        }

        // Each worker produced a local partial result; fold them here, on
        // the single coordinating path.
        let mut parsed = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(BatchOutcome::Parsed(tagged)) => parsed.push(tagged),
                Ok(BatchOutcome::Failed(failure)) => failures.push(failure),
                Err(e) => {
                    warn!("Analysis task panicked: {e}");
                    failures.push(PartialFailure {
                        scope: scope.label(),
                        reason: format!("analysis task panicked: {e}"),
                    });
                }
            }
        }
        failures.sort_by(|a, b| (&a.scope, &a.reason).cmp(&(&b.scope, &b.reason)));

        if total > 0 && parsed.is_empty() {
            warn!(
                kind = kind.as_str(),
                scope = %scope.label(),
                "All analysis batches failed; report will have empty findings"
            );
        }
        info!(
            kind = kind.as_str(),
            scope = %scope.label(),
            parsed = parsed.len(),
            failed = failures.len(),
            "Analysis run finished"
        );

        let findings = if parsed.is_empty() {
            Findings::empty(kind)
        } else {
            merge::merge(kind, parsed)
        };

        AnalysisReport {
            analysis_type: kind,
            scope,
            generated_at: Utc::now(),
            findings,
            partial_failures: failures,
        }
    }
}

async fn process_batch(
    model: Arc<dyn CompletionClient>,
    settings: EngineSettings,
    cancel: CancellationToken,
    kind: AnalysisKind,
    batch: AnalysisBatch,
) -> BatchOutcome {
    let label = batch.label();
    let base_prompt = prompts::batch_prompt(kind, &batch, settings.excerpt_chars);
    let mut strict = false;
    let mut attempts = 0u32;

    loop {
        let prompt = if strict {
            prompts::stricter(&base_prompt)
        } else {
            base_prompt.clone()
        };

        match model.complete(&prompt, settings.max_tokens).await {
            Ok(text) => match merge::parse_part(kind, &text) {
                Ok(part) => {
                    debug!(batch = %label, "Batch parsed");
                    return BatchOutcome::Parsed(TaggedFindings {
                        scope: batch.scope.clone(),
                        index: batch.index,
                        part,
                    });
                }
                Err(parse_err) if !strict => {
                    debug!(batch = %label, "Malformed response, retrying stricter: {parse_err}");
                    strict = true;
                }
                Err(parse_err) => {
                    return BatchOutcome::Failed(PartialFailure {
                        scope: label,
                        reason: parse_err.to_string(),
                    });
                }
            },
            Err(model_err) => {
                attempts += 1;
                if attempts >= settings.max_attempts {
                    return BatchOutcome::Failed(PartialFailure {
                        scope: label,
                        reason: format!("{model_err} (after {attempts} attempts)"),
                    });
                }
                let delay = settings.backoff.delay_for(attempts);
                warn!(
                    batch = %label,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Model call failed, backing off: {model_err}"
                );
                tokio::select! {
                    () = cancel.cancelled() => {
                        return BatchOutcome::Failed(PartialFailure {
                            scope: label,
                            reason: "cancelled during backoff".to_string(),
                        });
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
