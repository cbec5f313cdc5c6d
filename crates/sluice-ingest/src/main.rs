//! Sluice Ingest - bulk loading tool

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use sluice_common::logging::{init_logging, LogConfig, LogLevel};
use sluice_ingest::source::{ApiSourceConfig, FileSourceConfig, SourceConfig};
use sluice_ingest::{
    BulkSink, CheckpointStore, ConflictPolicy, DatabaseConfig, IngestConfig, IngestError, Job,
    JobSpec, MemorySink, PgBulkWriter, StreamingPipeline, TableSchema,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "sluice-ingest")]
#[command(author, version, about = "Stream files and paginated APIs into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one ingestion job
    Run(RunArgs),

    /// Inspect or remove saved checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand, Debug)]
enum CheckpointAction {
    /// Print a job's checkpoint as JSON
    Show { job_id: String },
    /// Delete a job's checkpoint
    Clear { job_id: String },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Target table (customers, orders, price_list)
    #[arg(short, long)]
    table: TableSchema,

    /// Job id; reuse it with --resume to continue an interrupted run
    #[arg(long)]
    job_id: Option<String>,

    /// Delimited file with a header line
    #[arg(long, conflicts_with = "api", required_unless_present = "api")]
    file: Option<PathBuf>,

    /// Field delimiter for --file
    #[arg(long, default_value_t = ',')]
    delimiter: char,

    /// First page URL of a paginated JSON API
    #[arg(long)]
    api: Option<String>,

    /// Dot path of the record array in each page
    #[arg(long, default_value = "data")]
    data_path: String,

    /// Dot path of the next page locator
    #[arg(long, default_value = "next")]
    next_page_path: String,

    /// Dot path of a total record count
    #[arg(long)]
    total_path: Option<String>,

    /// Send the next page locator as this query parameter
    #[arg(long)]
    page_param: Option<String>,

    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,

    #[arg(long, default_value_t = 1_000)]
    max_pages: u32,

    /// Extra request header, NAME=VALUE (repeatable)
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// What to do when a key already exists (nothing, update, error)
    #[arg(long, default_value = "nothing")]
    on_conflict: ConflictPolicy,

    /// Fail on the first rejected row
    #[arg(long)]
    strict: bool,

    /// Continue from the job's checkpoint
    #[arg(long, requires = "job_id")]
    resume: bool,

    /// Validate and encode without touching the database
    #[arg(long)]
    dry_run: bool,
}

fn parse_header(raw: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {raw:?}"))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

impl RunArgs {
    fn source(&self) -> SourceConfig {
        match (&self.file, &self.api) {
            (Some(path), _) => {
                SourceConfig::File(FileSourceConfig::new(path).with_delimiter(self.delimiter))
            },
            (None, url) => SourceConfig::Api(ApiSourceConfig {
                data_path: self.data_path.clone(),
                next_page_path: self.next_page_path.clone(),
                total_path: self.total_path.clone(),
                page_param: self.page_param.clone(),
                timeout_ms: self.timeout_ms,
                max_pages: self.max_pages,
                headers: self.headers.iter().cloned().collect(),
                ..ApiSourceConfig::new(url.clone().unwrap_or_default())
            }),
        }
    }

    fn spec(&self) -> JobSpec {
        let job_id = self
            .job_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.table, uuid::Uuid::new_v4()));
        JobSpec::new(job_id, self.table, self.source())
            .with_on_conflict(self.on_conflict)
            .with_strict_mode(self.strict)
            .with_resume(self.resume)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("sluice-ingest")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    let config = IngestConfig::from_env()?;

    match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::Checkpoint { action } => checkpoint(config, action).await,
    }
}

async fn run(config: IngestConfig, args: RunArgs) -> Result<()> {
    let sink: Arc<dyn BulkSink> = if args.dry_run {
        info!("Dry run, rows are kept in memory");
        Arc::new(MemorySink::new())
    } else {
        let pool = DatabaseConfig::from_env()?.create_pool().await?;
        Arc::new(PgBulkWriter::new(pool))
    };

    let pipeline = StreamingPipeline::new(config, sink);
    let spec = args.spec();
    let job_id = spec.job_id.clone();
    let registry = pipeline.registry().clone();

    let bar = progress_bar(&job_id);
    let mut subscription = registry.subscribe(&job_id);
    let watcher = {
        let bar = bar.clone();
        tokio::spawn(async move {
            while let Some(job) = subscription.next().await {
                render(&bar, &job);
                if job.status.is_terminal() {
                    break;
                }
            }
        })
    };

    let interrupt = {
        let registry = registry.clone();
        let job_id = job_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(job_id = %job_id, "Interrupted, cancelling at the next row boundary");
                if let Err(e) = registry.cancel(&job_id, Some("interrupted by operator".into())) {
                    warn!(error = %e, "Cancel request ignored");
                }
            }
        })
    };

    let outcome = pipeline.run(spec).await;
    interrupt.abort();
    watcher.abort();
    if let Some(job) = registry.get_job(&job_id) {
        render(&bar, &job);
    }
    bar.finish();

    match outcome {
        Ok(result) => {
            info!(
                job_id = %result.job_id,
                attempted = result.attempted_rows,
                inserted = result.inserted_rows,
                rejected = result.rejected_rows,
                conflicts_skipped = result.conflicts_skipped,
                "Ingestion complete"
            );
            if let Some(path) = &result.dead_letter_path {
                warn!(path = %path, rows = result.rejected_rows, "Rejected rows written");
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        },
        Err(IngestError::Cancelled { .. }) => {
            warn!(job_id = %job_id, "Job cancelled; rerun with --job-id {job_id} --resume to continue");
            Ok(())
        },
        Err(e) => Err(e).with_context(|| format!("job {job_id} failed")),
    }
}

async fn checkpoint(config: IngestConfig, action: CheckpointAction) -> Result<()> {
    let store = CheckpointStore::new(config.checkpoint_dir);
    match action {
        CheckpointAction::Show { job_id } => match store.load(&job_id).await? {
            Some(checkpoint) => println!("{}", serde_json::to_string_pretty(&checkpoint)?),
            None => println!("No checkpoint for {job_id}"),
        },
        CheckpointAction::Clear { job_id } => {
            if store.delete(&job_id).await? {
                info!(job_id = %job_id, "Checkpoint removed");
            } else {
                println!("No checkpoint for {job_id}");
            }
        },
    }
    Ok(())
}

fn progress_bar(job_id: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(format!("{job_id}: starting"));
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

fn render(bar: &ProgressBar, job: &Job) {
    if let Some(total) = job.estimated_total {
        if bar.length() != Some(total) {
            bar.set_length(total);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
        }
    }
    bar.set_position(job.attempted_rows);
    bar.set_message(format!(
        "{} {}: {} inserted, {} rejected",
        job.id, job.status, job.inserted_rows, job.rejected_rows
    ));
}
