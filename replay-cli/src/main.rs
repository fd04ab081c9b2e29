//! Replay buffer server binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use replay_cli::config::ServerConfig;
use replay_cli::grpc::ReplayService;
use replay_core::Table;
use replay_storage::{Checkpointer, FileCheckpointer};
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Replay buffer gRPC server
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set the log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the replay buffer server
    Start {
        /// gRPC port (overrides the config file when set)
        #[arg(short, long)]
        port: Option<u16>,

        /// Path to a TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = cli.log_level.parse::<Level>().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;

    match cli.command {
        Commands::Start { port, config } => start(port, config).await,
    }
}

async fn start(port: Option<u16>, config_path: Option<PathBuf>) -> Result<()> {
    let config = ServerConfig::load(config_path.as_deref())?;
    let port = port.unwrap_or(config.server.port);

    let tables: Vec<Arc<Table>> = config
        .tables
        .iter()
        .map(|section| Table::new(section.name.clone(), section.options()))
        .collect();

    let checkpointer: Option<Arc<dyn Checkpointer>> = config.checkpoint.enabled().then(|| {
        let mut checkpointer = FileCheckpointer::new(&config.checkpoint.root);
        if !config.checkpoint.fallback.is_empty() {
            checkpointer = checkpointer.with_fallback(&config.checkpoint.fallback);
        }
        Arc::new(checkpointer) as Arc<dyn Checkpointer>
    });

    let service = ReplayService::new(tables, checkpointer, config.server.callback_executor_threads)?;

    info!(port, tables = config.tables.len(), "starting replay buffer server");
    service
        .serve_with_shutdown(port, async {
            let _ = signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
}
