//! Bucketing and analysis engines.

pub mod bucketing;
pub mod engine;
pub mod merge;
pub mod prompts;

pub use bucketing::{BucketPlanner, Granularity, Plan, TimeframeSpec};
pub use engine::{AnalysisEngine, EngineSettings};

use crate::store::models::{PostRecord, Scope};

/// A bounded group of records submitted together to the language model.
///
/// Batches of one run partition the filtered record set: overflow within one
/// time interval spills into further batches with the same scope and an
/// incremented `index`, so the merge step can fold them back together.
#[derive(Debug, Clone)]
pub struct AnalysisBatch {
    pub scope: Scope,
    pub index: usize,
    pub records: Vec<PostRecord>,
}

impl AnalysisBatch {
    /// Label used in logs and partial-failure entries.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}#{}", self.scope.label(), self.index)
    }
}
