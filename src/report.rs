//! Report serialization through the record store.

use std::str::FromStr;

use tracing::info;

use crate::store::models::AnalysisReport;
use crate::store::{report_key, RecordStore, StoreError};

/// Serialization shape for persisted reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    JsonPretty,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "json-pretty" | "pretty" => Ok(Self::JsonPretty),
            other => Err(format!("must be 'json' or 'json-pretty', got '{other}'")),
        }
    }
}

/// Writes final aggregates to the store, overwriting any previous report
/// for the same `(analysis_type, scope)`.
pub struct ReportWriter {
    store: RecordStore,
    format: OutputFormat,
}

impl ReportWriter {
    #[must_use]
    pub fn new(store: RecordStore, format: OutputFormat) -> Self {
        Self { store, format }
    }

    /// Persist a report, returning its store key.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the store write fails.
    pub async fn write(&self, report: &AnalysisReport) -> Result<String, StoreError> {
        let key = report_key(report.analysis_type, &report.scope);
        let bytes = match self.format {
            OutputFormat::Json => serde_json::to_vec(report),
            OutputFormat::JsonPretty => serde_json::to_vec_pretty(report),
        }
        .map_err(|source| StoreError::Codec {
            key: key.clone(),
            source,
        })?;

        let outcome = self.store.put_raw(&key, &bytes).await?;
        info!(key = %key, ?outcome, "Report persisted");
        Ok(key)
    }
}
