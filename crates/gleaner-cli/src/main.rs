mod io;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use gleaner_client::{PageParser, ReqwestFetcher};
use gleaner_core::models::RecordStatus;
use gleaner_core::{
    AppError, CheckpointEntry, EnrichmentConfig, EnrichmentService, FetcherPool, FieldExtractor,
    JsonlCheckpointStore, PageFetcher, Pipeline, RetryPolicy, RunReport, SchedulerConfig,
    ThrottleConfig, ThrottledFetcher, TracingWorkerReporter,
};

use crate::io::{FileRecordSource, FileResultSink};

#[derive(Parser)]
#[command(
    name = "gleaner",
    version,
    about = "Resumable, fault-tolerant dataset metadata enrichment"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enrich every record in an input file, resuming from the checkpoint
    Run(RunArgs),

    /// Show checkpoint progress without fetching anything
    Status {
        /// Checkpoint log to inspect
        #[arg(short, long, env = "GLEANER_CHECKPOINT", default_value = "gleaner.checkpoint.jsonl")]
        checkpoint: PathBuf,

        /// Print the failed records' reasons
        #[arg(long, default_value_t = false)]
        failures: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Input records (.json array of objects, or .csv)
    #[arg(short, long)]
    input: PathBuf,

    /// Enrichment config (extraction rules, comparison policy)
    #[arg(short, long, env = "GLEANER_CONFIG")]
    config: PathBuf,

    /// Checkpoint log; re-running with the same file resumes
    #[arg(long, env = "GLEANER_CHECKPOINT", default_value = "gleaner.checkpoint.jsonl")]
    checkpoint: PathBuf,

    /// Directory for enriched.json, enriched.csv and summary.json
    #[arg(short, long, env = "GLEANER_OUTPUT", default_value = "output")]
    output: PathBuf,

    /// Input column holding the record id (the page URL)
    #[arg(long, default_value = "id")]
    id_field: String,

    /// Concurrent workers
    #[arg(short, long, env = "GLEANER_WORKERS", default_value_t = 3)]
    workers: usize,

    /// Fetcher pool size (defaults to the worker count)
    #[arg(long, env = "GLEANER_FETCHERS")]
    fetchers: Option<usize>,

    /// Retries after the first attempt for transient failures
    #[arg(long, env = "GLEANER_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Base backoff delay; attempt k waits base * 2^k
    #[arg(long, env = "GLEANER_BASE_DELAY_MS", default_value_t = 1000)]
    base_delay_ms: u64,

    /// Per-attempt deadline
    #[arg(long, env = "GLEANER_ITEM_TIMEOUT_SECS", default_value_t = 30)]
    item_timeout_secs: u64,

    /// Whole-run deadline; unstarted records are recorded as cancelled
    #[arg(long, env = "GLEANER_RUN_TIMEOUT_SECS")]
    run_timeout_secs: Option<u64>,

    /// Minimum delay between requests to one host (0 = off)
    #[arg(long, env = "GLEANER_THROTTLE_MS", default_value_t = 0)]
    throttle_ms: u64,

    /// Render pages in headless Chromium instead of plain HTTP
    #[cfg(feature = "browser")]
    #[arg(long, default_value_t = false)]
    browser: bool,
}

impl RunArgs {
    fn scheduler_config(&self) -> SchedulerConfig {
        let config = SchedulerConfig::default()
            .with_workers(self.workers)
            .with_retry(RetryPolicy::new(
                self.max_retries,
                Duration::from_millis(self.base_delay_ms),
            ))
            .with_item_timeout(Duration::from_secs(self.item_timeout_secs));
        match self.run_timeout_secs {
            Some(secs) => config.with_run_timeout(Duration::from_secs(secs)),
            None => config,
        }
    }

    fn throttle(&self) -> ThrottleConfig {
        let delay = Duration::from_millis(self.throttle_ms);
        ThrottleConfig::new(delay).with_jitter(delay / 2)
    }

    fn fetcher_count(&self) -> usize {
        self.fetchers.unwrap_or(self.workers)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gleaner=info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::Status {
            checkpoint,
            failures,
        } => cmd_status(&checkpoint, failures).await.map(|()| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            if is_run_fatal(&e) {
                tracing::error!("Run aborted: {e:#}");
                tracing::info!("Checkpointed records are kept; re-run the same command to resume");
            } else {
                tracing::error!("{e:#}");
            }
            ExitCode::from(2)
        }
    }
}

/// Whether `e` is an engine error that aborted the whole run.
fn is_run_fatal(e: &anyhow::Error) -> bool {
    e.downcast_ref::<AppError>().is_some_and(AppError::is_run_fatal)
}

async fn cmd_run(args: RunArgs) -> Result<ExitCode> {
    let config = EnrichmentConfig::from_path(&args.config)?;
    args.scheduler_config().validate()?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing in-flight records");
            ctrl_c.cancel();
        }
    });

    #[cfg(feature = "browser")]
    {
        if args.browser {
            let fetcher = gleaner_client::BrowserFetcher::with_timeout(Duration::from_secs(
                args.item_timeout_secs,
            ))
            .await?;
            let report = run_pipeline(fetcher, &args, config, &cancel).await?;
            return finish(report);
        }
    }

    let fetcher = ReqwestFetcher::with_timeout(Duration::from_secs(args.item_timeout_secs))
        .context("Failed to create HTTP client")?;
    let report = run_pipeline(fetcher, &args, config, &cancel).await?;
    finish(report)
}

async fn run_pipeline<F: PageFetcher>(
    fetcher: F,
    args: &RunArgs,
    config: EnrichmentConfig,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    let fetchers = FetcherPool::replicate(
        ThrottledFetcher::new(fetcher, args.throttle()),
        args.fetcher_count(),
    )?;
    let fields: Vec<String> = config.extraction.field_names().map(String::from).collect();
    let extractor = FieldExtractor::new(PageParser::new(config.json_parser()), config.extraction);
    let service = EnrichmentService::new(fetchers, extractor, config.comparison);

    let store = JsonlCheckpointStore::open(&args.checkpoint)
        .await
        .with_context(|| format!("Failed to open checkpoint {}", args.checkpoint.display()))?;
    let pipeline = Pipeline::new(store, args.scheduler_config()).with_fields(fields);

    let report = pipeline
        .run(
            &FileRecordSource::new(&args.input, args.id_field.as_str()),
            &service,
            &FileResultSink::new(&args.output),
            cancel,
            &TracingWorkerReporter,
        )
        .await?;
    Ok(report)
}

fn finish(report: RunReport) -> Result<ExitCode> {
    let overview = serde_json::json!({
        "run_id": report.run_id,
        "started_at": report.started_at,
        "finished_at": report.finished_at,
        "exit_status": report.exit_status,
        "succeeded": report.summary.succeeded,
        "partially_succeeded": report.summary.partially_succeeded,
        "failed": report.summary.failed,
        "skipped": report.summary.skipped,
        "field_completion": report.summary.field_completion,
    });
    println!("{}", serde_json::to_string_pretty(&overview)?);
    Ok(ExitCode::from(report.exit_status.code()))
}

async fn cmd_status(checkpoint: &Path, show_failures: bool) -> Result<()> {
    if !checkpoint.exists() {
        println!("No checkpoint at {}", checkpoint.display());
        return Ok(());
    }
    let store = JsonlCheckpointStore::open(checkpoint)
        .await
        .with_context(|| format!("Failed to read checkpoint {}", checkpoint.display()))?;
    let entries = store.entries().await;

    let mut counts: BTreeMap<RecordStatus, usize> = BTreeMap::new();
    for entry in &entries {
        *counts.entry(entry.status).or_default() += 1;
    }

    println!("Checkpoint {} ({} records):\n", store.path().display(), entries.len());
    for (status, count) in &counts {
        println!("  {:<20} {count}", status.as_str());
    }

    let failed: Vec<&CheckpointEntry> = entries
        .iter()
        .filter(|e| e.status == RecordStatus::Failed)
        .collect();
    if show_failures && !failed.is_empty() {
        println!("\nFailed records:\n");
        for entry in failed {
            let when = entry
                .completed_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {} [{when}] after {} attempt(s): {}",
                entry.record_id,
                entry.total_attempts,
                entry.last_error.as_deref().unwrap_or("unknown error"),
            );
        }
    }

    Ok(())
}
