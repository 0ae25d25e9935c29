//! CLI command definitions for qrelay.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::config::{EnqueueOptions, WorkerOptions};
use crate::dedup::RedisDedupCache;
use crate::enqueue::{Enqueuer, SendOutcome};
use crate::events::OutputMode;
use crate::idle::IdleChecker;
use crate::queue::redis::RedisQueue;
use crate::queue::QueueClient;
use crate::shutdown::install_shutdown_handler;
use crate::worker::{PollingScheduler, QueueResolver, ResolveOptions};

/// Queue relay: enqueue shell commands and run them with a worker.
#[derive(Parser)]
#[command(name = "qrelay")]
#[command(about = "Enqueue shell commands to managed queues and run them with a worker")]
#[command(version)]
#[command(
    long_about = "qrelay enqueues shell commands as queue messages and runs them with a \
worker that keeps each message's visibility lease alive while the job runs.\n\n\
Example usage:\n  \
qrelay enqueue jobs 'tar czf /backups/home.tgz /home'\n  \
qrelay worker 'jobs*' --drain"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis URL backing the queue service.
    #[arg(
        long,
        default_value = "redis://localhost:6379",
        env = "QRELAY_REDIS_URL",
        global = true
    )]
    pub redis_url: String,

    /// Namespace prepended to logical queue names.
    #[arg(long, default_value = "qrelay_", global = true)]
    pub prefix: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Enqueue a shell command (or a file of commands) onto a queue.
    #[command(alias = "send")]
    Enqueue(EnqueueArgs),

    /// Receive and execute queued commands.
    ///
    /// Resolves the given queue patterns on a fixed interval and runs one
    /// poll loop per selected queue. Each received payload runs through
    /// the shell; success deletes the message, failure leaves it for the
    /// queue's redrive policy.
    #[command(alias = "listen")]
    Worker(WorkerArgs),

    /// List the queues the given patterns resolve to.
    Queues(QueuesArgs),
}

/// Arguments for `qrelay enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Target queue (logical name; the prefix is applied automatically).
    pub queue: String,

    /// The shell command to enqueue.
    #[arg(required_unless_present = "file")]
    pub command: Option<String>,

    /// Newline-delimited file of commands; blank lines and # comments are
    /// skipped.
    #[arg(long, conflicts_with = "command")]
    pub file: Option<PathBuf>,

    /// FIFO message group id (required for .fifo queues).
    #[arg(long)]
    pub group_id: Option<String>,

    /// Skip commands whose content hash was enqueued recently.
    #[arg(long)]
    pub dedup: bool,

    /// Seconds a content hash suppresses duplicates.
    #[arg(long, default_value_t = 21600)]
    pub dedup_ttl: u64,
}

/// Arguments for `qrelay worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Queue names or single-* wildcard patterns.
    #[arg(required = true)]
    pub patterns: Vec<String>,

    /// Long-poll wait per receive call, in seconds.
    #[arg(long, default_value_t = 20)]
    pub wait_time: u64,

    /// Initial visibility timeout for received messages, in seconds.
    #[arg(long, default_value_t = 30)]
    pub visibility_timeout: u32,

    /// Hard deadline after which a running job is killed, in seconds.
    #[arg(long, default_value_t = 270)]
    pub kill_after: u64,

    /// Interval between queue re-resolution cycles, in seconds.
    #[arg(long, default_value_t = 10)]
    pub resolve_interval: u64,

    /// Poll failure-suffixed queues too.
    #[arg(long)]
    pub include_failed: bool,

    /// Only poll queues currently reporting messages.
    #[arg(long)]
    pub active_only: bool,

    /// Poll FIFO-suffixed queues instead of standard ones.
    #[arg(long)]
    pub fifo: bool,

    /// Exit once a full pass over the queues processes nothing.
    #[arg(long)]
    pub drain: bool,

    /// Suppress all non-essential output.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Human-readable progress instead of JSON events.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Arguments for `qrelay queues`.
#[derive(Parser, Debug)]
pub struct QueuesArgs {
    /// Queue names or single-* wildcard patterns.
    #[arg(required = true)]
    pub patterns: Vec<String>,

    /// Include failure and dead-letter queues.
    #[arg(long)]
    pub include_failed: bool,

    /// List FIFO queues instead of standard ones.
    #[arg(long)]
    pub fifo: bool,
}

/// Parses CLI arguments from the process environment.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses and runs in one step.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Runs the selected subcommand.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Enqueue(args) => run_enqueue(&cli, args).await,
        Commands::Worker(args) => run_worker(&cli, args).await,
        Commands::Queues(args) => run_queues(&cli, args).await,
    }
}

async fn connect(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = redis::Client::open(redis_url)?;
    Ok(ConnectionManager::new(client).await?)
}

async fn run_enqueue(cli: &Cli, args: &EnqueueArgs) -> anyhow::Result<()> {
    let conn = connect(&cli.redis_url).await?;
    let client: Arc<dyn QueueClient> = Arc::new(RedisQueue::from_connection(conn.clone()));

    let mut opts = EnqueueOptions::default()
        .with_prefix(cli.prefix.clone())
        .with_dedup(args.dedup)
        .with_dedup_ttl(Duration::from_secs(args.dedup_ttl));
    if let Some(group_id) = &args.group_id {
        opts = opts.with_group_id(group_id.clone());
    }

    let enqueuer =
        Enqueuer::new(client, opts).with_dedup_cache(Arc::new(RedisDedupCache::new(conn)));

    match (&args.command, &args.file) {
        (Some(command), None) => {
            match enqueuer.send_command(&args.queue, command).await? {
                SendOutcome::Sent { message_id } => {
                    println!("{}", serde_json::json!({ "sent": 1, "message_id": message_id }));
                }
                SendOutcome::Deduplicated => {
                    println!("{}", serde_json::json!({ "sent": 0, "deduplicated": 1 }));
                }
            }
        }
        (None, Some(path)) => {
            let summary = enqueuer.send_batch_file(&args.queue, path).await?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        // clap enforces exactly one of the two.
        _ => unreachable!("clap requires exactly one of command/--file"),
    }
    Ok(())
}

async fn run_worker(cli: &Cli, args: &WorkerArgs) -> anyhow::Result<()> {
    let conn = connect(&cli.redis_url).await?;
    let client: Arc<dyn QueueClient> = Arc::new(RedisQueue::from_connection(conn));

    let output = if args.quiet {
        OutputMode::Quiet
    } else if args.verbose {
        OutputMode::Verbose
    } else {
        OutputMode::Default
    };

    let opts = WorkerOptions::default()
        .with_prefix(cli.prefix.clone())
        .with_wait_time(Duration::from_secs(args.wait_time))
        .with_visibility_timeout_secs(args.visibility_timeout)
        .with_kill_after(Duration::from_secs(args.kill_after))
        .with_resolve_interval(Duration::from_secs(args.resolve_interval))
        .with_include_failed(args.include_failed)
        .with_active_only(args.active_only)
        .with_fifo(args.fifo)
        .with_drain(args.drain)
        .with_output(output);

    let cancel = install_shutdown_handler()?;
    let scheduler = PollingScheduler::new(client, opts, cancel);
    let stats = scheduler.listen(&args.patterns).await?;

    if !args.quiet {
        eprintln!(
            "done: {} succeeded, {} failed, {} empty receives",
            stats.jobs_succeeded, stats.jobs_failed, stats.no_jobs
        );
    }
    info!(
        jobs_succeeded = stats.jobs_succeeded,
        jobs_failed = stats.jobs_failed,
        "Worker exit"
    );
    Ok(())
}

async fn run_queues(cli: &Cli, args: &QueuesArgs) -> anyhow::Result<()> {
    let conn = connect(&cli.redis_url).await?;
    let client: Arc<dyn QueueClient> = Arc::new(RedisQueue::from_connection(conn));

    let idle = Arc::new(IdleChecker::new(client.clone()));
    let resolver = QueueResolver::new(
        client,
        idle,
        ResolveOptions {
            prefix: cli.prefix.clone(),
            suffixes: Default::default(),
            include_failed: args.include_failed,
            fifo: args.fifo,
            active_only: false,
        },
    );

    let mut pairs = resolver.resolve(&args.patterns).await?;
    pairs.sort_by(|a, b| a.name.cmp(&b.name));
    for pair in pairs {
        println!("{}", pair.name);
    }
    Ok(())
}
