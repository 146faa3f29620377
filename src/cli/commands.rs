//! CLI command definitions for leaseworker.
//!
//! `run` starts the worker, `put` appends a job to the configured source and
//! `partitions` lists the partitions of the stream.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::config::{SourceKind, WorkerConfig};
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{
    DeadLetterFailureHandler, FailureHandler, JobManager, JobPayload, JobSource,
    NoReactionFailureHandler, QueueJobSource, SafeJobRunner, SleepLogicRunner, WorkerLoop,
};
use crate::shutdown::ShutdownArbiter;
use crate::stream::{
    CheckpointStore, PartitionLister, RedisLockProvider, RedisPartitionLister,
    RedisShortTermStore, RedisStreamReader, SqliteMarkerStore, StreamJobSource,
};

/// Partition used by `put` when none is given.
const DEFAULT_PARTITION: &str = "0";

/// Lease-aware background job worker.
#[derive(Parser)]
#[command(name = "leaseworker")]
#[command(about = "Run leased jobs from a partitioned stream or a point queue")]
#[command(version)]
#[command(
    long_about = "leaseworker pulls batches of jobs from a Redis-backed source and runs them on a fixed worker pool.\n\nConfiguration is read from the environment (WORKER_*, STREAM_*, QUEUE_*, REDIS_URL).\n\nExample usage:\n  leaseworker put --sleep 5 --partition 3\n  leaseworker run --threads 8"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the worker until SIGINT or SIGTERM.
    Run(RunArgs),

    /// Append a job to the stream or the queue.
    Put(PutArgs),

    /// List the partitions of the stream.
    #[command(alias = "ls")]
    Partitions,
}

/// Arguments for `leaseworker run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Job source to pull from (stream or queue). Overrides WORKER_JOB_SOURCE.
    #[arg(short, long)]
    pub source: Option<SourceKind>,

    /// Number of worker tasks. Overrides WORKER_THREAD_COUNT.
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Print the Prometheus text exposition when the worker stops.
    #[arg(long)]
    pub print_metrics: bool,
}

/// Arguments for `leaseworker put`.
#[derive(Parser, Debug)]
pub struct PutArgs {
    /// Seconds the job sleeps.
    #[arg(long)]
    pub sleep: u64,

    /// Stream partition to append to. Ignored for the queue.
    #[arg(short, long, default_value = DEFAULT_PARTITION)]
    pub partition: String,

    /// Where to put the job. Overrides WORKER_JOB_SOURCE.
    #[arg(short, long)]
    pub source: Option<SourceKind>,
}

impl Cli {
    /// Filter directive for the log subscriber: `RUST_LOG` when set,
    /// otherwise `--log-level`.
    pub fn log_filter(&self) -> String {
        resolve_log_filter(std::env::var("RUST_LOG").ok(), &self.log_level)
    }
}

fn resolve_log_filter(env_filter: Option<String>, log_level: &str) -> String {
    env_filter
        .filter(|f| !f.trim().is_empty())
        .unwrap_or_else(|| log_level.to_string())
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = WorkerConfig::from_env()?;
    match cli.command {
        Commands::Run(args) => run_worker_command(config, args).await,
        Commands::Put(args) => run_put_command(config, args).await,
        Commands::Partitions => run_partitions_command(config).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_worker_command(config: WorkerConfig, args: RunArgs) -> anyhow::Result<()> {
    let mut config = config;
    if let Some(source) = args.source {
        config = config.with_source(source);
    }
    if let Some(threads) = args.threads {
        config = config.with_worker_thread_count(threads);
    }
    config.validate()?;

    if args.print_metrics {
        init_metrics().context("Failed to initialize metrics")?;
    }

    let redis = connect_redis(&config.redis_url).await?;

    let source: Arc<dyn JobSource> = match config.source {
        SourceKind::Stream => Arc::new(build_stream_source(&config, redis.clone()).await?),
        SourceKind::Queue => Arc::new(QueueJobSource::from_connection(
            redis.clone(),
            &config.queue,
        )),
    };

    let failure_handler: Arc<dyn FailureHandler> = match &config.queue.dead_letter_queue {
        Some(dlq) => Arc::new(DeadLetterFailureHandler::from_connection(redis.clone(), dlq)),
        None => Arc::new(NoReactionFailureHandler),
    };

    let runner = Arc::new(SafeJobRunner::new(
        Arc::new(SleepLogicRunner::new()),
        failure_handler,
        config.internal_retry_count,
    ));
    let manager = Arc::new(
        JobManager::new(config.worker_count(), source.clone(), runner)
            .with_completion_poll_interval(config.completion_poll_interval),
    );

    let arbiter = ShutdownArbiter::new();
    let _signals = arbiter.listen_for_signals();

    info!(
        source = %config.source,
        workers = config.worker_count(),
        redis_url = %config.redis_url,
        "Starting leaseworker"
    );

    WorkerLoop::new(
        manager,
        source,
        arbiter,
        config.min_idle_wait,
        config.max_idle_wait,
    )
    .run()
    .await?;

    if args.print_metrics {
        println!("{}", export_metrics());
    }
    Ok(())
}

async fn run_put_command(config: WorkerConfig, args: PutArgs) -> anyhow::Result<()> {
    let redis = connect_redis(&config.redis_url).await?;
    let payload = JobPayload::sleep(args.sleep);

    match args.source.unwrap_or(config.source) {
        SourceKind::Stream => {
            let reader = RedisStreamReader::new(redis, &config.stream.stream_name);
            let id = reader
                .append(&args.partition, &payload)
                .await
                .context("Failed to append job to stream")?;
            println!(
                "{}:{} {}",
                config.stream.stream_name, args.partition, id
            );
        }
        SourceKind::Queue => {
            let queue = QueueJobSource::from_connection(redis, &config.queue);
            let id = queue
                .enqueue(&payload)
                .await
                .context("Failed to enqueue job")?;
            println!("{} {}", queue.queue_name(), id);
        }
    }
    Ok(())
}

async fn run_partitions_command(config: WorkerConfig) -> anyhow::Result<()> {
    let redis = connect_redis(&config.redis_url).await?;
    let lister = RedisPartitionLister::new(
        redis,
        &config.stream.stream_name,
        config.stream.list_page_size,
    );

    let partitions = lister
        .list_partitions()
        .await
        .context("Failed to list partitions")?;
    if partitions.is_empty() {
        info!(stream = %config.stream.stream_name, "Stream has no partitions");
    }
    for partition in partitions {
        println!("{}", partition);
    }
    Ok(())
}

async fn connect_redis(url: &str) -> anyhow::Result<ConnectionManager> {
    let client = redis::Client::open(url).with_context(|| format!("Invalid Redis URL: {}", url))?;
    ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", url))
}

async fn build_stream_source(
    config: &WorkerConfig,
    redis: ConnectionManager,
) -> anyhow::Result<StreamJobSource> {
    let stream = &config.stream;

    let markers = SqliteMarkerStore::open(&stream.checkpoint_db, stream.long_term_ttl)
        .await
        .with_context(|| {
            format!(
                "Failed to open checkpoint database {}",
                stream.checkpoint_db.display()
            )
        })?;
    let checkpoints = CheckpointStore::new(
        Arc::new(RedisShortTermStore::new(redis.clone())),
        Arc::new(markers),
        stream.short_term_ttl,
    );

    Ok(StreamJobSource::new(
        Arc::new(RedisPartitionLister::new(
            redis.clone(),
            &stream.stream_name,
            stream.list_page_size,
        )),
        Arc::new(RedisStreamReader::new(redis.clone(), &stream.stream_name)),
        Arc::new(RedisLockProvider::new(redis)),
        checkpoints,
        stream,
    ))
}
