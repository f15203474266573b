//! # Videoforge - Media Task Queue CLI
//!
//! Queues ffmpeg jobs (transcode, remux, trim, thumbnail extraction) in a
//! SQLite database and runs them one at a time, streaming progress to the
//! console and to any connected TCP clients.
//!
//! ## Usage
//!
//! ```bash
//! # Queue a single file
//! videoforge add movie.mkv --kind remux --params '{"outputExtension":"mp4"}'
//!
//! # Queue every video in a directory
//! videoforge scan /path/to/media --kind thumbnail --recursive
//!
//! # Run the queue and stream progress on port 7878
//! videoforge work --listen 127.0.0.1:7878
//!
//! # Stop a task the worker is running
//! videoforge cancel 3
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use videoforge::commands::{
    add::AddCommand,
    cancel::CancelCommand,
    delete::DeleteCommand,
    list::ListCommand,
    scan::{ScanCommand, ScanOptions},
    work::WorkCommand,
};
use videoforge::config::Config;

/// Videoforge - A durable, single-worker media task queue
#[derive(Parser)]
#[command(
    name = "videoforge",
    about = "A durable, single-worker media task queue",
    long_about = "Queues ffmpeg transcode, remux, trim and thumbnail jobs and runs them one at a time with crash recovery.",
    version
)]
struct Cli {
    /// Path to the task database
    #[arg(long, global = true, env = "VIDEOFORGE_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Queue a task for a single media file
    Add {
        /// Path to the input file
        input: PathBuf,
        /// Task type: transcode, remux, trim or thumbnail
        #[arg(long, short)]
        kind: String,
        /// Output path (derived from the input when omitted)
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// JSON parameters for the task type
        #[arg(long, short)]
        params: Option<String>,
        /// Delete the input once the task finishes successfully
        #[arg(long)]
        delete_original: bool,
    },
    /// Scan a directory for video files and queue a task for each
    Scan {
        /// Directory to scan (defaults to the previously scanned one)
        directory: Option<PathBuf>,
        /// Task type: transcode, remux, trim or thumbnail
        #[arg(long, short)]
        kind: String,
        /// Descend into subdirectories
        #[arg(long, short)]
        recursive: bool,
        /// Only queue files whose name matches this glob, e.g. "*.mkv"
        #[arg(long)]
        pattern: Option<String>,
        /// Directory for derived output paths
        #[arg(long, short = 'd')]
        output_dir: Option<PathBuf>,
        /// JSON parameters for the task type
        #[arg(long, short)]
        params: Option<String>,
        /// Delete inputs once their tasks finish successfully
        #[arg(long)]
        delete_original: bool,
    },
    /// Run queued tasks until interrupted
    Work {
        /// Stream progress events as JSON lines to TCP clients on this address
        #[arg(long, short)]
        listen: Option<SocketAddr>,
    },
    /// Show stored tasks
    List,
    /// Cancel a queued or running task in the running worker
    Cancel {
        /// Task id
        id: i64,
    },
    /// Delete a stored task and its output
    Delete {
        /// Task id
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "videoforge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(db) = cli.db {
        config.database_path = db;
    }

    let result = match cli.command {
        Commands::Add {
            input,
            kind,
            output,
            params,
            delete_original,
        } => {
            info!("Starting add command for: {:?}, kind: {}", input, kind);
            AddCommand::new(input, kind, output, params, delete_original, config)
                .execute()
                .await
                .map(|_| ())
        }
        Commands::Scan {
            directory,
            kind,
            recursive,
            pattern,
            output_dir,
            params,
            delete_original,
        } => {
            info!(
                "Starting scan command for: {:?}, kind: {}, recursive: {}",
                directory, kind, recursive
            );
            let options = ScanOptions {
                recursive,
                pattern,
                output_dir,
                params,
                delete_original,
            };
            ScanCommand::new(directory, kind, options, config)
                .execute()
                .await
                .map(|_| ())
        }
        Commands::Work { listen } => {
            info!("Starting work command, listen: {:?}", listen);
            WorkCommand::new(listen, config).execute().await
        }
        Commands::List => {
            let list_cmd = ListCommand::new(config);
            match list_cmd.execute().await {
                Ok(tasks) => {
                    list_cmd.print(&tasks);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        Commands::Cancel { id } => CancelCommand::new(id, config).execute().await.map(|_| ()),
        Commands::Delete { id } => DeleteCommand::new(id, config).execute().await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
