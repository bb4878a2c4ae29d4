//! ShardRun CLI - partition work, run shards locally, and aggregate reports.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shardrun_core::{aggregate, ingest, shard, GlobalReport, ShardOutcome, ShardPlan};
use shardrun_worker::layout::{read_descriptors, read_reports_in};
use shardrun_worker::{GitFetcher, RunLayout, TarArchiver, ToolConfig, Worker};

mod scheduler;

use scheduler::LocalScheduler;

/// ShardRun CLI - Partition, process, and aggregate work items
#[derive(Parser)]
#[command(name = "shardrun")]
#[command(about = "Shard work items across workers and merge their reports", long_about = None)]
struct Cli {
    /// Run directory holding shards, reports and artifacts
    #[arg(short, long, default_value = "output", global = true)]
    run_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Partition a descriptor list into shards and write the manifest
    Shard(ShardArgs),

    /// Merge shard reports into the global report
    Aggregate {
        /// Additional directories to collect report-shard-*.json files from
        #[arg(long = "reports-dir")]
        reports_dirs: Vec<PathBuf>,

        /// Exit with an error if the run is incomplete or inconsistent
        #[arg(long)]
        strict: bool,
    },

    /// Shard, process every shard locally, then aggregate
    Run {
        #[command(flatten)]
        sharding: ShardArgs,

        /// Shards processed at the same time
        #[arg(short, long, default_value = "4")]
        parallel: usize,

        /// Items processed concurrently within each shard
        #[arg(short, long, default_value = "1")]
        concurrency: usize,

        /// Cancel a shard after this many seconds (0 = no limit)
        #[arg(long, default_value = "0")]
        timeout_secs: u64,

        /// Organisation recorded for items that do not name one
        #[arg(long)]
        org: Option<String>,

        /// Path to the git binary
        #[arg(long, default_value = "git")]
        git: String,

        /// Path to the tar binary
        #[arg(long, default_value = "tar")]
        tar: String,

        /// Exit with an error if the run is incomplete or inconsistent
        #[arg(long)]
        strict: bool,
    },

    /// Print the global report of a run
    Show,
}

#[derive(Args)]
struct ShardArgs {
    /// JSON array of work descriptors
    #[arg(short, long)]
    input: PathBuf,

    /// Requested number of workers
    #[arg(short, long, allow_negative_numbers = true)]
    workers: i64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("shardrun=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let layout = RunLayout::new(&cli.run_dir);

    match cli.command {
        Commands::Shard(args) => {
            let plan = shard_to_layout(&layout, &args).await?;
            print_plan(&plan);
        }
        Commands::Aggregate {
            reports_dirs,
            strict,
        } => {
            let global = aggregate_layout(&layout, &reports_dirs).await?;
            print_global(&global);
            if strict {
                global.check()?;
            }
        }
        Commands::Run {
            sharding,
            parallel,
            concurrency,
            timeout_secs,
            org,
            git,
            tar,
            strict,
        } => {
            let plan = shard_to_layout(&layout, &sharding).await?;
            print_plan(&plan);

            match tokio::fs::remove_dir_all(layout.reports_dir()).await {
                Ok(()) => info!("Cleared reports from a previous run"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            let tools = ToolConfig {
                git_path: git,
                tar_path: tar,
                ..ToolConfig::default()
            };
            let mut config = layout.worker_config();
            config.max_concurrent_items = concurrency;
            config.default_org = org;
            config.shard_timeout = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));

            let worker = Worker::new(
                config,
                Arc::new(GitFetcher::new(&tools)),
                Arc::new(TarArchiver::new(&tools)),
            );
            let failed = LocalScheduler::new(layout.clone(), worker, parallel)
                .run(&plan.manifest)
                .await;
            if !failed.is_empty() {
                warn!(shards = ?failed, "Some shards produced no report");
            }

            let global = aggregate_layout(&layout, &[]).await?;
            print_global(&global);
            if strict {
                global.check()?;
            }
        }
        Commands::Show => {
            let global = layout.read_global_report().await?;
            print_global(&global);
        }
    }

    Ok(())
}

/// Ingest the descriptor file, partition it and persist the plan.
///
/// Nothing is written if ingestion or partitioning fails.
async fn shard_to_layout(
    layout: &RunLayout,
    args: &ShardArgs,
) -> Result<ShardPlan, Box<dyn std::error::Error>> {
    let descriptors = read_descriptors(&args.input).await?;
    let items = ingest(descriptors)?;
    let plan = shard(items, args.workers)?;
    layout.write_plan(&plan).await?;
    Ok(plan)
}

/// Aggregate every report found for the layout's manifest and persist the result.
async fn aggregate_layout(
    layout: &RunLayout,
    extra_dirs: &[PathBuf],
) -> Result<GlobalReport, Box<dyn std::error::Error>> {
    let manifest = layout.read_manifest().await?;

    let mut reports = layout.read_reports().await?;
    for dir in extra_dirs {
        reports.extend(read_reports_in(dir).await?);
    }
    info!(reports = reports.len(), "Collected shard reports");

    let global = aggregate(&manifest, reports);
    let path = layout.write_global_report(&global).await?;
    info!(path = %path.display(), "Global report written");
    Ok(global)
}

fn print_plan(plan: &ShardPlan) {
    let manifest = &plan.manifest;
    println!(
        "Sharded {} items across {} workers ({} requested):",
        manifest.total_items, manifest.effective_workers, manifest.requested_workers
    );
    for entry in &manifest.shards {
        println!("  shard {:<4} {} items", entry.shard_id, entry.item_count);
    }
}

fn print_global(global: &GlobalReport) {
    println!("{}", "=".repeat(60));
    println!("RUN REPORT {}", global.run_id);
    println!("{}", "=".repeat(60));
    println!(
        "{:<8}  {:<9}  {:>8}  {:>8}  {:>8}  {:>9}",
        "SHARD", "OUTCOME", "ITEMS", "SUCCESS", "FAILED", "RETRYABLE"
    );
    println!("{}", "-".repeat(60));
    for shard in &global.shards {
        println!(
            "{:<8}  {:<9}  {:>8}  {:>8}  {:>8}  {:>9}",
            shard.shard_id,
            outcome_name(shard.outcome),
            format!("{}/{}", shard.reported_items, shard.expected_items),
            shard.counts.success,
            shard.counts.failed,
            shard.counts.retryable,
        );
    }
    println!("{}", "-".repeat(60));
    println!("Total items:   {}/{}", global.total_items, global.expected_items);
    println!("Successful:    {}", global.counts.success);
    println!("Failed:        {}", global.counts.failed);
    println!("Retryable:     {}", global.counts.retryable);
    println!("Success rate:  {:.1}%", global.success_rate * 100.0);
    println!("Complete:      {}", global.complete);
    println!("Integrity OK:  {}", global.integrity_ok);

    if !global.issues.is_empty() {
        println!("Issues:");
        for issue in &global.issues {
            match serde_json::to_string(issue) {
                Ok(json) => println!("  - {}", json),
                Err(_) => println!("  - {:?}", issue),
            }
        }
    }
}

fn outcome_name(outcome: ShardOutcome) -> &'static str {
    match outcome {
        ShardOutcome::Complete => "COMPLETE",
        ShardOutcome::Partial => "PARTIAL",
        ShardOutcome::Missing => "MISSING",
    }
}
