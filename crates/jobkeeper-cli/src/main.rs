use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use prettytable::{row, Table};
use tracing::info;

use jobkeeper_core::{
    Config, Error, EventBus, FilesystemBackend, HandlerRegistry, JobId, QueueBackend, QueueDriver,
    QueueManager, QueueManagerConfig, RelationalBackend, Result, Scheduler, SyncBackend, Worker,
    WorkerConfig,
};

mod handlers;

#[derive(Parser)]
#[command(name = "jobkeeper")]
#[command(about = "Cron scheduler and reliable job queue")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Set log level")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scheduler operations
    Scheduler {
        #[command(subcommand)]
        command: SchedulerCommands,
    },

    /// Worker operations
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },

    /// Failed job storage operations
    Failed {
        #[command(subcommand)]
        command: FailedCommands,
    },

    /// Delete every Pending/Reserved job from a queue, or every failed job
    Flush {
        #[arg(long, help = "Queue to flush; defaults to the configured default queue")]
        queue: Option<String>,

        #[arg(long, help = "Flush failed jobs instead of the live queue")]
        failed: bool,
    },

    /// Print pending/failed job counts
    Stats {
        #[arg(long, help = "Queues to report on", default_values_t = Vec::<String>::new())]
        queue: Vec<String>,
    },

    /// Generate shell completion scripts
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
pub enum SchedulerCommands {
    /// Load a schedule file and poll it once a minute until interrupted
    Run {
        #[arg(long = "schedule-dir", help = "Directory holding the schedule file", default_value = ".")]
        config_dir: PathBuf,

        #[arg(long = "config-file", help = "Schedule file name within --schedule-dir", default_value = "schedule.yaml")]
        config_file: PathBuf,

        #[arg(long, help = "Poll interval in seconds", alias = "tick-seconds", default_value_t = 60)]
        interval: u64,

        #[arg(long, help = "Run a single tick and exit instead of looping forever")]
        poll: bool,

        #[arg(long, help = "Log every due-entry check at debug level")]
        debug: bool,
    },
}

#[derive(Subcommand)]
pub enum WorkerCommands {
    /// Poll the configured queues and process jobs until interrupted
    Run {
        #[arg(long, help = "Queues to poll, in priority order", value_delimiter = ',')]
        queue: Vec<String>,

        #[arg(long, help = "Process exactly one job then exit")]
        once: bool,

        #[arg(long, help = "Exit the first time every queue is empty, instead of sleeping")]
        stop_when_empty: bool,

        #[arg(long, help = "Idle poll interval in seconds", default_value_t = 3)]
        sleep: u64,

        #[arg(long, help = "Stop after this many successfully handled jobs; 0 is unbounded", default_value_t = 0)]
        max_jobs: u64,

        #[arg(long, help = "Soft per-job timeout in seconds, surfaced to handlers only")]
        timeout: Option<u64>,
    },
}

#[derive(Subcommand)]
pub enum FailedCommands {
    /// List failed jobs
    List {
        #[arg(long, help = "Restrict to one queue")]
        queue: Option<String>,
    },
    /// Re-enqueue a failed job as a fresh Pending job
    Retry {
        id: Option<String>,

        #[arg(long, help = "Retry every failed job instead of a single id")]
        all: bool,
    },
    /// Permanently delete a failed job without retrying it
    Forget { id: String },
    /// Delete every failed job, optionally scoped to one queue
    Clear {
        #[arg(long)]
        queue: Option<String>,
    },
}

async fn build_backend(config: &Config) -> Result<Arc<dyn QueueBackend>> {
    match config.queue.driver {
        QueueDriver::Database => {
            let backend = RelationalBackend::connect(config.database.adapter, &config.database.connection_url()).await?;
            Ok(Arc::new(backend))
        }
        QueueDriver::File => Ok(Arc::new(FilesystemBackend::new(&config.queue.file_path)?)),
        QueueDriver::Sync => {
            let mut registry = HandlerRegistry::new();
            handlers::register_demo_handlers(&mut registry);
            Ok(Arc::new(SyncBackend::new(Arc::new(registry), Arc::new(EventBus::with_default_tracing()))))
        }
    }
}

fn build_manager_config(config: &Config) -> QueueManagerConfig {
    QueueManagerConfig {
        default_queue: config.queue.default.clone(),
        retry_after: chrono::Duration::seconds(config.queue.retry_after as i64),
        max_attempts: config.queue.max_attempts,
        backoff_seconds: config.queue.backoff,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut <Cli as clap::CommandFactory>::command(), "jobkeeper", &mut std::io::stdout());
        return Ok(());
    }

    let log_level = cli.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let config = if let Some(ref config_path) = cli.config {
        Config::load(config_path.to_str().unwrap())?
    } else {
        Config::from_env()?
    };

    info!("starting jobkeeper v{}", jobkeeper_core::VERSION);

    if let Err(e) = run(cli.command, config).await {
        eprintln!("{}", format!("error: {}", e).red());
        std::process::exit(1);
    }

    Ok(())
}

async fn run(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Scheduler { command } => run_scheduler(command, config).await,
        Commands::Worker { command } => run_worker(command, config).await,
        Commands::Failed { command } => run_failed(command, config).await,
        Commands::Flush { queue, failed } => run_flush(queue, failed, config).await,
        Commands::Stats { queue } => run_stats(queue, config).await,
        Commands::Completions { .. } => unreachable!("handled in main before config load"),
    }
}

async fn run_scheduler(command: SchedulerCommands, config: Config) -> Result<()> {
    let SchedulerCommands::Run {
        config_dir,
        config_file,
        interval,
        poll,
        debug,
    } = command;

    let schedule_path = config_dir.join(config_file);

    let backend = build_backend(&config).await?;
    let mut registry = HandlerRegistry::new();
    handlers::register_demo_handlers(&mut registry);
    let events = Arc::new(EventBus::with_default_tracing());
    let manager = Arc::new(QueueManager::new(backend, Arc::new(registry), events.clone(), build_manager_config(&config)));

    let mut scheduler = Scheduler::new(manager, events);
    scheduler.set_debug(debug);
    scheduler.load_file(
        schedule_path
            .to_str()
            .ok_or_else(|| Error::config("schedule file path is not valid UTF-8"))?,
    )?;

    if poll {
        let fired = scheduler.poll(chrono::Utc::now()).await?;
        println!("{}", format!("polled once, {} entr(y/ies) fired", fired).green());
        return Ok(());
    }

    println!("{}", format!("scheduler started, polling every {}s", interval).green());
    scheduler.run_forever(StdDuration::from_secs(interval)).await
}

async fn run_worker(command: WorkerCommands, config: Config) -> Result<()> {
    let WorkerCommands::Run {
        queue,
        once,
        stop_when_empty,
        sleep,
        max_jobs,
        timeout,
    } = command;

    let queues = if queue.is_empty() {
        vec![config.queue.default.clone()]
    } else {
        queue
    };

    let backend = build_backend(&config).await?;
    let mut registry = HandlerRegistry::new();
    handlers::register_demo_handlers(&mut registry);
    let events = Arc::new(EventBus::with_default_tracing());
    let manager = Arc::new(QueueManager::new(backend, Arc::new(registry), events.clone(), build_manager_config(&config)));

    let worker = Worker::new(
        manager,
        events,
        WorkerConfig {
            queues: queues.clone(),
            poll_interval: StdDuration::from_secs(sleep),
            max_jobs: if once { 1 } else { max_jobs },
            stop_when_empty: stop_when_empty || once,
            timeout: timeout.map(StdDuration::from_secs),
        },
    );
    worker.install_signal_handlers();

    println!("{}", format!("worker started, queues: {}", queues.join(", ")).green());
    let processed = worker.run().await?;
    println!("{}", format!("worker stopped, jobs processed: {}", processed).green());
    Ok(())
}

async fn run_failed(command: FailedCommands, config: Config) -> Result<()> {
    let backend = build_backend(&config).await?;

    match command {
        FailedCommands::List { queue } => {
            let failed = backend.get_failed_jobs(queue.as_deref()).await?;
            let mut table = Table::new();
            table.add_row(row!["id", "queue", "failed_at", "exception"]);
            for job in &failed {
                table.add_row(row![
                    job.id.to_string(),
                    job.queue,
                    job.failed_at.to_rfc3339(),
                    truncate(&job.exception, 80)
                ]);
            }
            table.printstd();
            println!("{} failed job(s)", failed.len());
        }
        FailedCommands::Retry { id, all } => {
            if all {
                let failed = backend.get_failed_jobs(None).await?;
                let mut retried = 0u64;
                for job in &failed {
                    if backend.retry_failed_job(&job.id).await?.is_some() {
                        retried += 1;
                    }
                }
                println!("{}", format!("retried {} failed job(s)", retried).green());
            } else {
                let id = id.ok_or_else(|| Error::config("failed retry requires <id> or --all"))?;
                match backend.retry_failed_job(&JobId(id.clone())).await? {
                    Some(job) => {
                        println!("{}", format!("retried {} as {}", id, job.id).green());
                    }
                    None => {
                        eprintln!("{}", format!("no failed job with id {}", id).yellow());
                        std::process::exit(1);
                    }
                }
            }
        }
        FailedCommands::Forget { id } => {
            if backend.forget_failed_job(&JobId(id.clone())).await? {
                println!("{}", format!("forgot {}", id).green());
            } else {
                eprintln!("{}", format!("no failed job with id {}", id).yellow());
                std::process::exit(1);
            }
        }
        FailedCommands::Clear { queue } => {
            let count = backend.clear_failed_jobs(queue.as_deref()).await?;
            println!("{}", format!("cleared {} failed job(s)", count).green());
        }
    }

    Ok(())
}

async fn run_flush(queue: Option<String>, failed: bool, config: Config) -> Result<()> {
    let backend = build_backend(&config).await?;
    if failed {
        let count = backend.clear_failed_jobs(queue.as_deref()).await?;
        println!("{}", format!("flushed {} failed job(s)", count).green());
        return Ok(());
    }
    let queue = queue.unwrap_or_else(|| config.queue.default.clone());
    let count = backend.clear(&queue).await?;
    println!("{}", format!("flushed {} job(s) from queue {}", count, queue).green());
    Ok(())
}

async fn run_stats(queues: Vec<String>, config: Config) -> Result<()> {
    let backend = build_backend(&config).await?;
    let queues = if queues.is_empty() {
        vec![config.queue.default.clone()]
    } else {
        queues
    };

    let mut table = Table::new();
    table.add_row(row!["queue", "pending"]);
    for queue in &queues {
        let size = backend.size(queue).await?;
        table.add_row(row![queue, size]);
    }
    table.printstd();

    let failed = backend.get_failed_jobs(None).await?;
    println!("failed: {}", failed.len());
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max])
    }
}
