//! RRS Ingest - recognition dataset loader

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rrs_common::logging::{init_logging, LogConfig, LogLevel};
use rrs_ingest::config::{IngestConfig, PerformanceProfile};
use rrs_ingest::loader::{LoadReport, LoadRequest, RecognitionLoader, StatusReport};
use rrs_ingest::{IngestError, PgDatabase};
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const EXIT_FAILURE: i32 = 1;
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "rrs-ingest")]
#[command(author, version, about = "Load recognition records into PostgreSQL and S3")]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Use .env.production and production pacing
    #[arg(long, global = true)]
    production: bool,

    /// Performance profile
    #[arg(long, value_enum, global = true, env = "INGEST_PROFILE", default_value_t = PerformanceProfile::Balanced)]
    profile: PerformanceProfile,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load recognitions from the dataset
    Load {
        /// Dataset root (searched in DATASET_PATHS when omitted)
        #[arg(short, long)]
        source: Option<PathBuf>,

        /// Process at most this many record directories
        #[arg(short, long)]
        limit: Option<usize>,

        /// Batch identifier written into every row
        #[arg(long)]
        batch_id: Option<String>,

        /// Reprocess recognitions that are already loaded
        #[arg(long)]
        force: bool,

        /// Stage uploads under the temp prefix and promote them on commit
        #[arg(long)]
        temp_storage: bool,

        /// Load the annotation feed after the recognitions
        #[arg(long)]
        with_annotations: bool,
    },

    /// Load the detection annotation feed
    LoadAnnotations {
        /// Annotation JSON file (defaults to ANNOTATIONS_FILE)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Delete the rows and images of one batch
    Reset {
        #[arg(long)]
        batch_id: String,

        /// Skip the confirmation prompt
        #[arg(long)]
        confirm: bool,
    },

    /// Show database and bucket health
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("rrs-ingest")
        .filter_directives("sqlx=warn,aws_config=warn,aws_smithy_runtime=warn")
        .build();

    // Environment variables take precedence over the flags
    let guard = match log_config.merge_env().and_then(|config| init_logging(&config)) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            None
        },
    };

    let code = match run(&cli).await {
        Ok(()) => 0,
        Err(e) if is_cancelled(&e) => {
            warn!("Interrupted");
            eprintln!("Interrupted");
            EXIT_CANCELLED
        },
        Err(e) => {
            error!(error = %format!("{:#}", e), "Command failed");
            eprintln!("Error: {:#}", e);
            EXIT_FAILURE
        },
    };

    drop(guard);
    process::exit(code);
}

fn is_cancelled(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<IngestError>()
        .is_some_and(IngestError::is_cancelled)
}

async fn run(cli: &Cli) -> Result<()> {
    let config =
        IngestConfig::from_env(cli.production, cli.profile).context("Invalid configuration")?;
    info!(
        environment = %config.environment,
        profile = ?config.profile,
        threads = config.threads,
        batch_size = config.batch_size,
        "Configuration loaded"
    );

    let loader = RecognitionLoader::connect(config)
        .await
        .context("Failed to connect to database or storage")?;

    match &cli.command {
        Command::Load {
            source,
            limit,
            batch_id,
            force,
            temp_storage,
            with_annotations,
        } => {
            let request = LoadRequest {
                source: source.clone(),
                limit: *limit,
                batch_id: batch_id.clone(),
                force: *force,
                use_temp_storage: temp_storage.then_some(true),
                show_progress: true,
            };
            run_load(&loader, &request, *with_annotations).await
        },
        Command::LoadAnnotations { file } => {
            let summary = loader
                .load_annotations(file.as_deref())
                .await
                .context("Annotation load failed")?;
            println!(
                "Annotations: {} received, {} loaded, {} filtered",
                summary.received, summary.loaded, summary.filtered
            );
            Ok(())
        },
        Command::Reset { batch_id, confirm } => {
            if !*confirm && !confirm_reset(batch_id)? {
                println!("Aborted");
                return Ok(());
            }
            let report = loader
                .reset_batch(batch_id)
                .await
                .with_context(|| format!("Reset of batch '{}' failed", batch_id))?;
            println!(
                "Reset {}: {} recognitions, {} rows, {} blobs deleted ({} failed)",
                report.batch_id,
                report.recognition_ids.len(),
                report.rows.recognition_files + report.rows.recipes + report.rows.annotations,
                report.blobs.deleted,
                report.blobs.failed + report.prefixes_failed
            );
            Ok(())
        },
        Command::Status => {
            let report = loader.status().await;
            print_status(&report);
            if report.is_healthy() {
                Ok(())
            } else {
                anyhow::bail!("Health check failed")
            }
        },
    }
}

async fn run_load(
    loader: &RecognitionLoader<PgDatabase>,
    request: &LoadRequest,
    with_annotations: bool,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, finishing in-flight work");
            signal_token.cancel();
        }
    });

    let result = loader.load(request, &cancel).await;
    println!("{}", loader.metrics().format_summary());
    let report = result.context("Load failed")?;
    print_load_report(&report);

    if with_annotations && !cancel.is_cancelled() {
        let summary = loader
            .load_annotations(None)
            .await
            .context("Annotation load failed")?;
        println!(
            "Annotations: {} received, {} loaded, {} filtered",
            summary.received, summary.loaded, summary.filtered
        );
    }
    Ok(())
}

fn print_load_report(report: &LoadReport) {
    println!("Batch:          {}", report.batch_id);
    println!("Dataset:        {}", report.dataset.display());
    println!("Processed:      {}", report.processed);
    println!("Already loaded: {}", report.already_loaded);
    println!("Committed:      {} ({} batches)", report.committed, report.batches);
    println!("Skipped:        {}", report.skips.len());

    let mut reasons: BTreeMap<&str, usize> = BTreeMap::new();
    for skip in &report.skips {
        *reasons.entry(skip.reason.as_str()).or_default() += 1;
    }
    for (reason, count) in reasons {
        println!("  {:<22} {}", reason, count);
    }
}

fn print_status(report: &StatusReport) {
    match &report.database_error {
        None => println!("Database: ok"),
        Some(e) => println!("Database: FAILED ({})", e),
    }
    match &report.storage_error {
        None => println!("Bucket {}: ok", report.bucket),
        Some(e) => println!("Bucket {}: FAILED ({})", report.bucket, e),
    }
    for count in &report.tables {
        match count.rows {
            Some(rows) => println!("  {:<24} {}", count.table, rows),
            None => println!("  {:<24} missing", count.table),
        }
    }
}

fn confirm_reset(batch_id: &str) -> Result<bool> {
    print!("Delete all rows and images of batch '{}'? [y/N] ", batch_id);
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
