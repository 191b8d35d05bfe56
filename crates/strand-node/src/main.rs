//! Strand node.
//!
//! ```bash
//! # Run a development node rooted at the current directory
//! strand run
//!
//! # Inspect and administer its store
//! strand streams
//! strand delete-stream 20aa...
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Strand - per-stream durable event logs.
#[derive(Parser)]
#[command(name = "strand")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory holding strand.toml (default: current directory).
    #[arg(short, long, global = true)]
    project: Option<PathBuf>,

    /// Read this TOML file instead of the layered configuration.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node and produce blocks until interrupted.
    Run,

    /// List stored streams.
    Streams,

    /// Remove a stream and all of its stored data.
    DeleteStream {
        /// Stream id in hex.
        stream_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = commands::load_config(cli.project.as_deref(), cli.config.as_deref())?;

    match cli.command {
        Commands::Run => commands::start::run(config).await,
        Commands::Streams => commands::streams::run(&config).await,
        Commands::DeleteStream { stream_id } => {
            commands::delete_stream::run(&config, &stream_id).await
        }
    }
}
