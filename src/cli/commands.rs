//! CLI command definitions for image-forge.
//!
//! Runs generation jobs end to end and exposes the maintenance operations
//! of the append log and the record index.

use crate::backend::DashScopeProcessor;
use crate::config::ForgeConfig;
use crate::journal::{parse_day, RecordLog};
use crate::metrics::init_metrics;
use crate::refine::QwenRefiner;
use crate::scheduler::{
    JobContext, JobDispatcher, JobSnapshot, LedgerSink, RefiningTaskGenerator, ServiceKind,
    TaskOutcome,
};
use crate::storage::{Database, Ingestor, RecordFilter};
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// How often `generate` polls its job.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Image generation job runner with a durable, hash-verified record log.
#[derive(Parser)]
#[command(name = "image-forge")]
#[command(about = "Run image generation jobs and manage their record log")]
#[command(version)]
#[command(
    long_about = "image-forge expands one prompt into N image generation tasks, runs them against DashScope, and records every completed job in a day-partitioned, hash-verified log and a SQLite index.\n\nExample usage:\n  image-forge generate --prompt \"a red fox in snow\" --count 4 --category animals"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file. Environment variables override it.
    #[arg(short, long, global = true, env = "FORGE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run one generation job and wait for it to finish.
    #[command(alias = "gen")]
    Generate(GenerateArgs),

    /// Check a day's log against its hash sidecar.
    Verify(VerifyArgs),

    /// Archive every finished day now, regardless of the archive hour.
    Archive,

    /// Replay log files into the record index.
    Ingest(IngestArgs),

    /// List stored records.
    Records(RecordsArgs),

    /// Compare a record's stored item count with its items.
    Validate(ValidateArgs),
}

/// Arguments for `image-forge generate`.
#[derive(Parser, Debug)]
pub struct GenerateArgs {
    /// Base prompt.
    #[arg(short, long)]
    pub prompt: String,

    /// Number of images to generate.
    #[arg(short = 'n', long, default_value = "1")]
    pub count: usize,

    /// Backend service (wan, z_image).
    #[arg(short, long, default_value = "wan")]
    pub service: String,

    /// Category; also the output subdirectory.
    #[arg(long, default_value = "default")]
    pub category: String,

    /// Style hint for prompt refinement.
    #[arg(long)]
    pub style: Option<String>,

    /// Negative prompt. Defaults to the configured one.
    #[arg(long)]
    pub negative: Option<String>,

    /// Model name. Defaults to the service's configured model.
    #[arg(short, long)]
    pub model: Option<String>,

    /// Backend size string.
    #[arg(long, default_value = "1024*1024")]
    pub size: String,

    /// Quality label recorded with the job.
    #[arg(long, default_value = "1K")]
    pub resolution: String,

    #[arg(long, default_value = "16:9")]
    pub aspect_ratio: String,

    /// Chain each task's prompt from the previous one and run serially.
    #[arg(long)]
    pub serial: bool,

    /// User id recorded with the job.
    #[arg(long)]
    pub user: Option<String>,

    /// Output JSON to stdout instead of progress lines.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `image-forge verify`.
#[derive(Parser, Debug)]
pub struct VerifyArgs {
    /// Day to verify (YYYY-MM-DD). Defaults to today (UTC).
    #[arg(short, long)]
    pub day: Option<String>,
}

/// Arguments for `image-forge ingest`.
#[derive(Parser, Debug)]
pub struct IngestArgs {
    /// A log file (`.json` or `.json.gz`) or a directory of them.
    pub path: PathBuf,
}

/// Arguments for `image-forge records`.
#[derive(Parser, Debug)]
pub struct RecordsArgs {
    /// Creation bucket (YYYYMMDDHH).
    #[arg(long)]
    pub created_at: Option<String>,

    #[arg(long)]
    pub category: Option<String>,

    #[arg(short, long)]
    pub model: Option<String>,

    #[arg(long)]
    pub status: Option<String>,

    #[arg(long, default_value = "20")]
    pub limit: i64,

    #[arg(long, default_value = "0")]
    pub offset: i64,
}

/// Arguments for `image-forge validate`.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Record id.
    pub record_id: i64,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = ForgeConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Generate(args) => run_generate_command(config, args).await,
        Commands::Verify(args) => run_verify_command(config, args).await,
        Commands::Archive => run_archive_command(config).await,
        Commands::Ingest(args) => run_ingest_command(config, args).await,
        Commands::Records(args) => run_records_command(config, args).await,
        Commands::Validate(args) => run_validate_command(config, args).await,
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Generate
// ============================================================================

fn job_context(args: &GenerateArgs, job_id: &str) -> anyhow::Result<JobContext> {
    let service: ServiceKind = args.service.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    if !service.is_image() {
        anyhow::bail!("service '{}' does not produce images", service);
    }

    let mut ctx = JobContext::new(args.prompt.clone(), service, args.count)
        .with_category(args.category.clone())
        .with_size(args.size.clone())
        .with_resolution(args.resolution.clone())
        .with_aspect_ratio(args.aspect_ratio.clone());
    if let Some(style) = &args.style {
        ctx = ctx.with_style(style.clone());
    }
    if let Some(negative) = &args.negative {
        ctx = ctx.with_negative_prompt(negative.clone());
    }
    if let Some(model) = &args.model {
        ctx = ctx.with_model(model.clone());
    }
    if let Some(user) = &args.user {
        let session = JobContext::derive_session_id(user, job_id);
        ctx = ctx.with_user(user.clone()).with_session(session);
    }
    Ok(ctx)
}

fn print_progress(snapshot: &JobSnapshot) {
    println!(
        "[{}] {}/{} ({}%)",
        snapshot.status, snapshot.progress.completed, snapshot.progress.total, snapshot.progress.percent
    );
}

async fn run_generate_command(mut config: ForgeConfig, args: GenerateArgs) -> anyhow::Result<()> {
    if args.count == 0 {
        anyhow::bail!("--count must be at least 1");
    }
    if args.serial {
        config.generation.prompt_inheritance = true;
    }
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registry unavailable");
    }

    let job_id = Uuid::new_v4().to_string();
    let ctx = job_context(&args, &job_id)?;

    let log = Arc::new(RecordLog::new(config.journal.clone()));
    log.start().await?;
    let database = Database::connect(&config.database).await?;
    let sink = LedgerSink::new(Arc::clone(&log)).with_database(database.clone());

    let refiner = Arc::new(QwenRefiner::from_settings(&config.backend)?);
    let generator = Arc::new(
        RefiningTaskGenerator::new(refiner, config.generation.clone())
            .with_backend_defaults(&config.backend),
    );
    let processor = Arc::new(DashScopeProcessor::new(config.backend.clone())?);

    let dispatcher = JobDispatcher::from_config(&config).with_sink(Arc::new(sink));
    dispatcher.start().await?;
    dispatcher.submit(&job_id, ctx, generator, processor)?;
    info!(job_id = %job_id, count = args.count, "Generation started");

    let mut last_completed = None;
    let snapshot = loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        let Some(snapshot) = dispatcher.poll(&job_id) else {
            anyhow::bail!("job {} disappeared from the job table", job_id);
        };
        if !args.json && last_completed != Some(snapshot.progress.completed) {
            print_progress(&snapshot);
            last_completed = Some(snapshot.progress.completed);
        }
        if snapshot.ready {
            break snapshot;
        }
    };

    dispatcher.stop().await?;
    log.stop().await?;
    database.close().await;

    if args.json {
        return print_json(&snapshot);
    }
    for (index, outcome) in snapshot.results.iter().enumerate() {
        match outcome {
            TaskOutcome::Success {
                url, saved_path, ..
            } => match saved_path {
                Some(path) => println!("  #{} ok    {}", index, path.display()),
                None => println!("  #{} ok    {}", index, url),
            },
            TaskOutcome::Failure { reason } => println!("  #{} fail  {}", index, reason),
        }
    }
    println!("Job {} {}", job_id, snapshot.status);
    Ok(())
}

// ============================================================================
// Log maintenance
// ============================================================================

async fn run_verify_command(config: ForgeConfig, args: VerifyArgs) -> anyhow::Result<()> {
    let day = match args.day.as_deref() {
        Some(label) => {
            parse_day(label).ok_or_else(|| anyhow::anyhow!("invalid day '{}', expected YYYY-MM-DD", label))?
        }
        None => Utc::now().date_naive(),
    };

    let log = RecordLog::new(config.journal);
    let report = log.verify_day(day).await?;
    print_json(&report)?;
    if !report.is_ok() {
        anyhow::bail!(
            "log for {} failed verification: {} mismatched, {} unhashed, {} unpaired",
            day,
            report.mismatched,
            report.unhashed,
            report.unpaired
        );
    }
    Ok(())
}

async fn run_archive_command(config: ForgeConfig) -> anyhow::Result<()> {
    let log = RecordLog::new(config.journal);
    let report = log.archive_now().await?;
    print_json(&report)
}

// ============================================================================
// Record index
// ============================================================================

async fn run_ingest_command(config: ForgeConfig, args: IngestArgs) -> anyhow::Result<()> {
    if !Path::new(&args.path).exists() {
        anyhow::bail!("Input path does not exist: {}", args.path.display());
    }
    let database = Database::connect(&config.database).await?;
    let report = Ingestor::new(database.clone()).ingest_path(&args.path).await?;
    database.close().await;
    print_json(&report)
}

async fn run_records_command(config: ForgeConfig, args: RecordsArgs) -> anyhow::Result<()> {
    let mut filter = RecordFilter::new()
        .with_limit(args.limit)
        .with_offset(args.offset);
    if let Some(created_at) = args.created_at {
        filter = filter.with_created_at(created_at);
    }
    if let Some(category) = args.category {
        filter = filter.with_category(category);
    }
    if let Some(model) = args.model {
        filter = filter.with_model(model);
    }
    if let Some(status) = args.status {
        filter = filter.with_status(status);
    }

    let database = Database::connect(&config.database).await?;
    let records = database.list_records(&filter).await?;
    database.close().await;
    print_json(&records)
}

async fn run_validate_command(config: ForgeConfig, args: ValidateArgs) -> anyhow::Result<()> {
    let database = Database::connect(&config.database).await?;
    let report = database.validate_record_integrity(args.record_id).await?;
    database.close().await;
    print_json(&report)?;
    if !report.is_consistent() {
        anyhow::bail!(
            "record {} stores item_count {} but has {} items",
            report.record_id,
            report.stored,
            report.actual
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> GenerateArgs {
        let mut argv = vec!["image-forge", "generate", "--prompt", "a fox"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Commands::Generate(args) => args,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_generate_defaults() {
        let args = args(&[]);
        assert_eq!(args.count, 1);
        assert_eq!(args.service, "wan");
        assert!(!args.serial);
    }

    #[test]
    fn test_job_context_from_args() {
        let args = args(&[
            "-n", "3", "--service", "z_image", "--category", "animals", "--user", "u1",
            "--negative", "blurry",
        ]);
        let ctx = job_context(&args, "job-1").unwrap();
        assert_eq!(ctx.count, 3);
        assert_eq!(ctx.service, ServiceKind::ZImage);
        assert_eq!(ctx.category, "animals");
        assert_eq!(ctx.negative_prompt.as_deref(), Some("blurry"));
        assert_eq!(ctx.session_id, JobContext::derive_session_id("u1", "job-1"));
    }

    #[test]
    fn test_text_service_is_rejected() {
        assert!(job_context(&args(&["--service", "text"]), "job-1").is_err());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["image-forge", "verify", "--day", "2025-01-02", "-l", "debug"]);
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Verify(args) => assert_eq!(args.day.as_deref(), Some("2025-01-02")),
            _ => unreachable!(),
        }
    }
}
