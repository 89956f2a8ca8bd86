use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::analysis::bucketing::TimeframeSpec;
use crate::report::OutputFormat;
use crate::store::models::AnalysisKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to parse {name} as float: {source}")]
    ParseFloat {
        name: String,
        #[source]
        source: std::num::ParseFloatError,
    },
}

/// Retry policy for rate-limited or failing remote calls.
///
/// Delays grow exponentially from `initial_delay` by `multiplier` per
/// attempt, capped at `max_delay`. After `max_retries` failed attempts the
/// caller degrades the operation to a partial failure.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl BackoffPolicy {
    /// Delay before the given retry attempt (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let scaled = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exp as i32);
        let capped = scaled.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Record store
    pub data_dir: PathBuf,

    // Listing API
    pub reddit_base_url: String,
    pub forums: Vec<String>,
    pub ingest_window: Duration,
    pub page_size: u32,
    pub ingest_concurrency: usize,
    pub listing_backoff: BackoffPolicy,

    // Model API
    pub model_base_url: String,
    pub model_api_key: Option<String>,
    pub model_name: String,
    pub model_max_tokens: u32,
    pub analysis_concurrency: usize,
    pub batch_max_records: usize,
    pub batch_max_attempts: u32,
    pub record_excerpt_chars: usize,
    pub model_backoff: BackoffPolicy,

    // Networking
    pub request_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            data_dir: PathBuf::from(env_or_default("DATA_DIR", "./data")),

            reddit_base_url: env_or_default("REDDIT_BASE_URL", "https://www.reddit.com"),
            forums: parse_forum_list(&env_or_default(
                "FORUMS",
                "HomeworkHelp,AskAcademia,Student",
            )),
            ingest_window: Duration::from_secs(
                parse_env_u64("INGEST_WINDOW_DAYS", 1095)? * 24 * 3600,
            ),
            page_size: parse_env_u32("REDDIT_PAGE_SIZE", 100)?,
            ingest_concurrency: parse_env_usize("INGEST_CONCURRENCY", 1)?,
            listing_backoff: BackoffPolicy {
                initial_delay: Duration::from_millis(parse_env_u64(
                    "LISTING_BACKOFF_INITIAL_MS",
                    2000,
                )?),
                multiplier: parse_env_f64("LISTING_BACKOFF_MULTIPLIER", 2.0)?,
                max_delay: Duration::from_millis(parse_env_u64("LISTING_BACKOFF_MAX_MS", 60_000)?),
                max_retries: parse_env_u32("LISTING_MAX_RETRIES", 5)?,
            },

            model_base_url: env_or_default("MODEL_BASE_URL", "https://api.openai.com"),
            model_api_key: optional_env("MODEL_API_KEY"),
            model_name: env_or_default("MODEL_NAME", "gpt-4.1-mini"),
            model_max_tokens: parse_env_u32("MODEL_MAX_TOKENS", 1024)?,
            analysis_concurrency: parse_env_usize("ANALYSIS_CONCURRENCY", 4)?,
            batch_max_records: parse_env_usize("BATCH_MAX_RECORDS", 25)?,
            batch_max_attempts: parse_env_u32("BATCH_MAX_ATTEMPTS", 3)?,
            record_excerpt_chars: parse_env_usize("RECORD_EXCERPT_CHARS", 1200)?,
            model_backoff: BackoffPolicy {
                initial_delay: Duration::from_millis(parse_env_u64(
                    "MODEL_BACKOFF_INITIAL_MS",
                    2000,
                )?),
                multiplier: parse_env_f64("MODEL_BACKOFF_MULTIPLIER", 2.0)?,
                max_delay: Duration::from_millis(parse_env_u64("MODEL_BACKOFF_MAX_MS", 60_000)?),
                max_retries: parse_env_u32("MODEL_MAX_RETRIES", 3)?,
            },

            request_timeout: Duration::from_secs(parse_env_u64("REQUEST_TIMEOUT_SECS", 30)?),
        })
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.forums.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "FORUMS".to_string(),
                message: "must list at least one subreddit".to_string(),
            });
        }
        if self.page_size == 0 || self.page_size > 100 {
            return Err(ConfigError::InvalidValue {
                name: "REDDIT_PAGE_SIZE".to_string(),
                message: "must be between 1 and 100".to_string(),
            });
        }
        if self.ingest_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                name: "INGEST_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.analysis_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                name: "ANALYSIS_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.batch_max_records == 0 {
            return Err(ConfigError::InvalidValue {
                name: "BATCH_MAX_RECORDS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.batch_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                name: "BATCH_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// A configuration suitable for tests: local endpoints, tiny backoff
    /// delays, no environment lookups.
    #[must_use]
    pub fn for_testing() -> Self {
        let fast_backoff = BackoffPolicy {
            initial_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_delay: Duration::from_millis(40),
            max_retries: 3,
        };
        Self {
            data_dir: PathBuf::from("./data"),
            reddit_base_url: "http://127.0.0.1:0".to_string(),
            forums: vec!["HomeworkHelp".to_string()],
            ingest_window: Duration::from_secs(365 * 24 * 3600),
            page_size: 100,
            ingest_concurrency: 1,
            listing_backoff: fast_backoff.clone(),
            model_base_url: "http://127.0.0.1:0".to_string(),
            model_api_key: Some("test-key".to_string()),
            model_name: "test-model".to_string(),
            model_max_tokens: 512,
            analysis_concurrency: 2,
            batch_max_records: 25,
            batch_max_attempts: 2,
            record_excerpt_chars: 400,
            model_backoff: fast_backoff,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-run selections passed into the bucketing and analysis engines.
///
/// This is the whole command surface: which forum to scope to, which
/// timeframe to resolve, which analyses to run, and how to serialize
/// the resulting reports.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub forum: Option<String>,
    pub timeframe: TimeframeSpec,
    pub output_format: OutputFormat,
    pub analysis: AnalysisSelection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisSelection {
    One(AnalysisKind),
    All,
}

impl AnalysisSelection {
    /// The analysis kinds this selection expands to, in a fixed order.
    #[must_use]
    pub fn kinds(self) -> Vec<AnalysisKind> {
        match self {
            Self::One(kind) => vec![kind],
            Self::All => vec![
                AnalysisKind::Topics,
                AnalysisKind::Patterns,
                AnalysisKind::Trends,
                AnalysisKind::Summary,
            ],
        }
    }
}

impl RunOptions {
    /// Load run options from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a timeframe, output format, or analysis type
    /// value does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let forum = optional_env("FORUM").filter(|f| !f.eq_ignore_ascii_case("all"));

        let timeframe_raw = env_or_default("TIMEFRAME", "last-3-months");
        let timeframe =
            timeframe_raw
                .parse::<TimeframeSpec>()
                .map_err(|e| ConfigError::InvalidValue {
                    name: "TIMEFRAME".to_string(),
                    message: e.to_string(),
                })?;

        let format_raw = env_or_default("OUTPUT_FORMAT", "json-pretty");
        let output_format =
            format_raw
                .parse::<OutputFormat>()
                .map_err(|e| ConfigError::InvalidValue {
                    name: "OUTPUT_FORMAT".to_string(),
                    message: e,
                })?;

        let analysis_raw = env_or_default("ANALYSIS_TYPE", "all");
        let analysis = if analysis_raw.eq_ignore_ascii_case("all") {
            AnalysisSelection::All
        } else {
            let kind =
                AnalysisKind::parse(&analysis_raw).ok_or_else(|| ConfigError::InvalidValue {
                    name: "ANALYSIS_TYPE".to_string(),
                    message: format!(
                        "must be topics, patterns, trends, summary, or all, got '{analysis_raw}'"
                    ),
                })?;
            AnalysisSelection::One(kind)
        };

        Ok(Self {
            forum,
            timeframe,
            output_format,
            analysis,
        })
    }
}

fn parse_forum_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_f64(name: &str, default: f64) -> Result<f64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseFloat {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forum_list() {
        assert_eq!(
            parse_forum_list("HomeworkHelp, AskAcademia ,Student"),
            vec!["HomeworkHelp", "AskAcademia", "Student"]
        );
        assert_eq!(parse_forum_list(""), Vec::<String>::new());
        assert_eq!(parse_forum_list(" , ,"), Vec::<String>::new());
    }

    #[test]
    fn test_backoff_delay_growth() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(500),
            max_retries: 5,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        // Capped at max_delay from here on
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(10), Duration::from_millis(500));
    }

    #[test]
    fn test_analysis_selection_kinds() {
        assert_eq!(
            AnalysisSelection::One(AnalysisKind::Trends).kinds(),
            vec![AnalysisKind::Trends]
        );
        assert_eq!(AnalysisSelection::All.kinds().len(), 4);
    }

    #[test]
    fn test_for_testing_validates() {
        Config::for_testing().validate().unwrap();
    }
}
