/// Formic daemon - main entry point.
/// Runs startup recovery, then keeps the queue scheduler polling until
/// shutdown.
use clap::Parser;
use formic_core::{
    CliAgentInvoker, EventBus, FileTemplateProvider, LedgerStore, QueueScheduler, SqliteTaskStore,
    WorkflowSequencer,
};
use formic_daemon::DaemonConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "formic-daemon",
    about = "Workflow engine daemon that drives agent-executed tasks",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to configuration file (TOML)"
    )]
    config: Option<PathBuf>,

    /// Workspace root
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Workspace root directory (default: current directory)"
    )]
    workspace: Option<PathBuf>,

    /// Database file
    #[arg(
        long,
        value_name = "PATH",
        help = "SQLite database file (default: .formic/formic.db under the workspace)"
    )]
    db: Option<PathBuf>,

    /// Agent command
    #[arg(long, value_name = "CMD", help = "Agent CLI command (default: claude)")]
    agent: Option<String>,

    /// Log level
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        default_value = "info",
        help = "Log level (trace, debug, info, warn, error)"
    )]
    log_level: String,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.parse()?))
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(true)
        .init();

    info!("Starting Formic daemon v{}", formic_daemon::VERSION);

    let mut config = match args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            DaemonConfig::load(&path)?
        }
        None => {
            info!("Using default configuration");
            DaemonConfig::default()
        }
    };

    // Apply CLI overrides
    if let Some(workspace) = args.workspace {
        config.engine.workspace_path = workspace;
    }
    if let Some(db) = args.db {
        config.engine.db_path = db;
    }
    if let Some(agent) = args.agent {
        config.engine.agent_command = agent;
    }

    let engine = config.engine.clone();
    info!(
        "Workspace: {}, database: {}",
        engine.workspace_path.display(),
        engine.resolved_db_path().display()
    );

    let store = Arc::new(SqliteTaskStore::new(engine.resolved_db_path()).await?);

    // Crash recovery: work interrupted by an unclean shutdown goes back to
    // todo before the scheduler can dispatch anything.
    let recovered = store.recover_interrupted().await?;
    if recovered > 0 {
        info!("Recovered {} interrupted task(s)", recovered);
    }

    let events = Arc::new(EventBus::new());
    let invoker = Arc::new(CliAgentInvoker::new(&engine, Arc::clone(&events)));
    let templates = Arc::new(FileTemplateProvider::new(&engine.workspace_path));
    let sequencer = Arc::new(WorkflowSequencer::new(
        Arc::clone(&store),
        LedgerStore::new(&engine.workspace_path),
        invoker,
        templates,
        events,
        engine.max_iterations,
    ));
    let scheduler = Arc::new(QueueScheduler::new(
        Arc::clone(&store),
        Arc::clone(&sequencer),
        engine.poll_interval_ms,
        engine.max_concurrent_tasks,
    ));
    let scheduler_handle = scheduler.start();

    info!("Formic daemon ready, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    scheduler.shutdown();
    scheduler_handle.await?;

    // Cancel any still-running workflow so agent processes get a clean
    // SIGTERM instead of dying with the daemon.
    for run in sequencer.active_runs() {
        info!(task_id = run.task_id, "Stopping active workflow run");
        sequencer.stop(run.task_id);
    }

    Ok(())
}
