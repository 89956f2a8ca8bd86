use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use subreddit_insights::analysis::{AnalysisEngine, BucketPlanner, EngineSettings, Granularity};
use subreddit_insights::config::{Config, RunOptions};
use subreddit_insights::ingest::IngestController;
use subreddit_insights::model::OpenAiClient;
use subreddit_insights::reddit::RedditClient;
use subreddit_insights::report::ReportWriter;
use subreddit_insights::store::RecordStore;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing()?;

    info!("Starting subreddit-insights");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let store = RecordStore::open(&config.data_dir)
        .await
        .context("Failed to open record store")?;
    info!(data_dir = %config.data_dir.display(), "Record store opened");

    // A shutdown signal stops new page/batch requests; in-flight work
    // finishes so already-written records and partial reports survive.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received, finishing in-flight work");
        signal_cancel.cancel();
    });

    let mode = std::env::args().nth(1).unwrap_or_else(|| "ingest".to_string());
    match mode.as_str() {
        "ingest" => run_ingest(&config, store, cancel).await,
        "analyze" => run_analysis(&config, store, cancel).await,
        other => anyhow::bail!("unknown mode '{other}'; expected 'ingest' or 'analyze'"),
    }
}

async fn run_ingest(config: &Config, store: RecordStore, cancel: CancellationToken) -> Result<()> {
    let client = RedditClient::new(config)?;
    let controller = IngestController::new(
        Arc::new(client),
        store,
        config.listing_backoff.clone(),
        config.ingest_concurrency,
        cancel,
    );

    let report = controller
        .ingest(&config.forums, config.ingest_window)
        .await?;

    info!(
        written = report.total_written(),
        failed_forums = report.partial_failures.len(),
        "Ingestion run complete"
    );
    for failure in &report.partial_failures {
        warn!(scope = %failure.scope, reason = %failure.reason, "Partial ingestion failure");
    }
    Ok(())
}

async fn run_analysis(config: &Config, store: RecordStore, cancel: CancellationToken) -> Result<()> {
    let options = RunOptions::from_env().context("Failed to load run options")?;
    let model = OpenAiClient::new(config)?;
    let planner = BucketPlanner::new(store.clone(), config.batch_max_records);
    let engine = AnalysisEngine::new(
        Arc::new(model),
        EngineSettings::from_config(config),
        cancel.clone(),
    );
    let writer = ReportWriter::new(store, options.output_format);

    for kind in options.analysis.kinds() {
        if cancel.is_cancelled() {
            warn!("Cancelled before '{}' analysis started", kind.as_str());
            break;
        }

        let plan = planner
            .plan(
                options.forum.as_deref(),
                &options.timeframe,
                Granularity::for_kind(kind),
                chrono::Utc::now(),
            )
            .await
            .with_context(|| format!("Failed to plan '{}' analysis", kind.as_str()))?;

        info!(
            kind = kind.as_str(),
            scope = %plan.scope.label(),
            batches = plan.batches.len(),
            "Starting analysis"
        );

        let report = engine.analyze(kind, plan.scope, plan.batches).await;
        let key = writer
            .write(&report)
            .await
            .with_context(|| format!("Failed to write '{}' report", kind.as_str()))?;

        info!(kind = kind.as_str(), key = %key, "Report written");
    }

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,subreddit_insights=debug"));

    // Check if JSON logging is requested
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
