// ABOUTME: CLI entry point for hierarchy-sync
// ABOUTME: Parses commands and routes to appropriate handlers

use clap::{Parser, Subcommand};
use hierarchy_sync::commands;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hierarchy-sync")]
#[command(about = "Delta-driven sync of organizational hierarchies into an HR system", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to the TOML configuration (built-in defaults when omitted)
    #[arg(long, env = "HIERARCHY_SYNC_CONFIG", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an extract into a group's new snapshot and start the run it triggers
    Ingest(commands::IngestArgs),
    /// Run a group and its downstream groups through every stage
    Run(commands::RunArgs),
    /// Invoke a single stage over a JSON run state
    Stage(commands::StageArgs),
    /// Consume an unordered group's queue
    Consume(commands::ConsumeArgs),
    /// Inspect or purge a group's queue
    Queue(commands::QueueArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = commands::load_config(cli.config.as_deref())?;
    let ctx = commands::open_context(config)?;

    match cli.command {
        Commands::Ingest(args) => commands::ingest::command(ctx, args).await,
        Commands::Run(args) => commands::run::command(ctx, args).await,
        Commands::Stage(args) => commands::stage::command(ctx, args).await,
        Commands::Consume(args) => commands::consume::command(ctx, args).await,
        Commands::Queue(args) => commands::queue::command(ctx, args).await,
    }
}
