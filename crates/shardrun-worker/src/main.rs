//! ShardRun Worker Daemon
//!
//! Processes exactly one shard of a run directory and writes its report.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shardrun_core::ShardId;
use shardrun_worker::{json_output, GitFetcher, RunLayout, TarArchiver, ToolConfig, Worker};

/// Process one shard and write its report
#[derive(Parser, Debug)]
#[command(name = "shardrun-worker")]
#[command(about = "Process one shard of a ShardRun run directory", long_about = None)]
struct Args {
    /// Run directory produced by `shardrun shard`
    #[arg(short, long, default_value = "output")]
    run_dir: String,

    /// Shard to process
    #[arg(short, long)]
    shard_id: u32,

    /// Items processed concurrently within the shard
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// Cancel the shard after this many seconds (0 = no limit)
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

    /// Clone full history instead of a shallow clone
    #[arg(long)]
    full_clone: bool,

    /// Timeout for a single clone in seconds
    #[arg(long, default_value = "300")]
    fetch_timeout_secs: u64,

    /// Emit JSON-line events on stdout
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing (stderr, stdout is reserved for JSON events)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("shardrun=info".parse()?))
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    if args.json {
        json_output::enable_json_mode();
    }

    let layout = RunLayout::new(&args.run_dir);
    let shard_id = ShardId::new(args.shard_id);

    let tools = ToolConfig {
        git_path: args.git,
        shallow_clone: !args.full_clone,
        fetch_timeout: Duration::from_secs(args.fetch_timeout_secs),
        tar_path: args.tar,
    };
    let mut config = layout.worker_config();
    config.max_concurrent_items = args.concurrency;
    config.default_org = args.org;
    config.shard_timeout = (args.timeout_secs > 0).then(|| Duration::from_secs(args.timeout_secs));

    info!(
        shard_id = %shard_id,
        run_dir = %layout.root().display(),
        "Starting ShardRun worker"
    );

    let shard = match layout.read_shard(shard_id).await {
        Ok(shard) => shard,
        Err(e) => {
            error!(shard_id = %shard_id, error = %e, "Failed to load shard");
            json_output::emit_error(&e.to_string());
            return Err(e.into());
        }
    };

    let worker = Worker::new(
        config,
        Arc::new(GitFetcher::new(&tools)),
        Arc::new(TarArchiver::new(&tools)),
    );
    let report = worker.process(shard).await;
    let path = layout.write_report(&report).await?;

    info!(
        shard_id = %shard_id,
        report = %path.display(),
        complete = report.is_complete(),
        "Shard report written"
    );

    Ok(())
}
