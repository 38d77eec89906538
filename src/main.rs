//! # Main — CLI Entry Point
//!
//! Routes subcommands to the coordinator server, the worker runtime, the
//! schema migrator, and the HTTP client commands. Shared concerns live
//! here: `.env` loading, tracing initialization, and configuration.

use anyhow::Result;
use clap::{Parser, Subcommand};

use ktrdr::{cli, config::Config, db, operation::OperationType, server, worker};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "ktrdr",
    about = "Coordination substrate for long-running training and backtesting operations"
)]
struct Cli {
    /// Coordinator base URL for client subcommands
    #[arg(long, env = "COORDINATOR_URL", default_value = "http://localhost:7100")]
    coordinator_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator (HTTP API, registry, reconciler)
    Coordinator,
    /// Run a worker runtime hosting one executor type
    Worker {
        /// Capability this worker advertises
        #[arg(long, value_parser = ["training", "backtesting"])]
        worker_type: String,
        /// Advertise GPU availability in the capability document
        #[arg(long, default_value_t = false)]
        gpu: bool,
    },
    /// Apply the database schema (idempotent)
    Migrate,
    /// Inspect and control operations via the coordinator API
    Operations {
        #[command(subcommand)]
        action: OperationAction,
    },
    /// Inspect and clean up checkpoints via the coordinator API
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum OperationAction {
    /// List operations, optionally filtered
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        operation_type: Option<String>,
        /// Only CANCELLED/FAILED operations with a checkpoint
        #[arg(long, default_value_t = false)]
        resumable: bool,
    },
    /// Show one operation
    Get { id: String },
    /// Create and dispatch an operation
    Create {
        #[arg(value_parser = ["training", "backtesting"])]
        operation_type: String,
        /// Request payload as inline JSON
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Request cancellation
    Cancel { id: String },
    /// Resume from the stored checkpoint
    Resume { id: String },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List checkpoint summaries
    List {
        #[arg(long)]
        older_than_hours: Option<i64>,
    },
    /// Delete a checkpoint (row and artifacts)
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();
    match args.command {
        Commands::Coordinator => {
            let config = Config::from_env()?;
            server::run(config).await
        }
        Commands::Worker { worker_type, gpu } => {
            let config = Config::from_env()?;
            let worker_type = OperationType::parse(&worker_type)
                .ok_or_else(|| anyhow::anyhow!("unknown worker type {}", worker_type))?;
            worker::run(config, worker_type, gpu).await
        }
        Commands::Migrate => {
            let config = Config::from_env()?;
            let database = db::Database::connect(&config.database_url).await?;
            database.run_migrations().await?;
            println!("schema applied");
            Ok(())
        }
        Commands::Operations { action } => {
            let url = &args.coordinator_url;
            match action {
                OperationAction::List {
                    status,
                    operation_type,
                    resumable,
                } => cli::operations_list(url, status.as_deref(), operation_type.as_deref(), resumable),
                OperationAction::Get { id } => cli::operations_get(url, &id),
                OperationAction::Create {
                    operation_type,
                    payload,
                } => {
                    let payload: serde_json::Value = serde_json::from_str(&payload)
                        .map_err(|e| anyhow::anyhow!("--payload is not valid JSON: {}", e))?;
                    cli::operations_create(url, &operation_type, payload)
                }
                OperationAction::Cancel { id } => cli::operations_cancel(url, &id),
                OperationAction::Resume { id } => cli::operations_resume(url, &id),
            }
        }
        Commands::Checkpoints { action } => {
            let url = &args.coordinator_url;
            match action {
                CheckpointAction::List { older_than_hours } => {
                    cli::checkpoints_list(url, older_than_hours)
                }
                CheckpointAction::Delete { id } => cli::checkpoints_delete(url, &id),
            }
        }
    }
}
