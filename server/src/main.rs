// blobctl - command-line access to workspace blob storage

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workspace_blobs::app;
use workspace_blobs::config::{StorageConfig, DEFAULT_LOG_FILTER};
use workspace_blobs::events::Event;

#[derive(Parser, Debug)]
#[command(name = "blobctl")]
#[command(about = "Read, write and list workspace blobs")]
#[command(version)]
struct Cli {
    /// Config file path (JSON)
    #[arg(short, long, env = "BLOBCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Storage root directory, overrides the config file
    #[arg(short, long, env = "BLOBCTL_ROOT")]
    root: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a file as a blob
    Put {
        workspace: String,
        key: String,
        file: PathBuf,
    },
    /// Fetch a blob, to a file or stdout
    Get {
        workspace: String,
        key: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List the blobs of a workspace as JSON
    List { workspace: String },
    /// Total size of a workspace's blobs in bytes
    Size { workspace: String },
    /// Mark a blob for deletion (kept in storage)
    Delete { workspace: String, key: String },
    /// Remove a blob from storage
    Purge { workspace: String, key: String },
    /// Tear down a workspace's blobs through the event bus
    DeleteWorkspace { workspace: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so blob bytes on stdout stay clean
    let filter = if cli.verbose { "debug" } else { DEFAULT_LOG_FILTER };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = match &cli.config {
        Some(path) => StorageConfig::load(path)
            .await
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => StorageConfig::default(),
    };
    if let Some(root) = cli.root {
        config.data_dir = root;
    }

    let (state, bus) = app::setup(&config).await?;
    let dispatcher = bus.spawn();
    let storage = &state.blob_storage;

    match cli.command {
        Command::Put {
            workspace,
            key,
            file,
        } => {
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {:?}", file))?;
            storage.put(&workspace, &key, &data).await?;
            println!("Stored {}/{} ({} bytes)", workspace, key, data.len());
        }
        Command::Get {
            workspace,
            key,
            output,
        } => {
            let data = storage.get(&workspace, &key).await?;
            match output {
                Some(path) => tokio::fs::write(&path, &data)
                    .await
                    .with_context(|| format!("Failed to write {:?}", path))?,
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
            }
        }
        Command::List { workspace } => {
            let blobs = storage.list(&workspace).await?;
            println!("{}", serde_json::to_string_pretty(&blobs)?);
        }
        Command::Size { workspace } => {
            println!("{}", storage.total_size(&workspace).await?);
        }
        Command::Delete { workspace, key } => {
            storage.delete(&workspace, &key).await?;
            println!("Marked {}/{} for deletion", workspace, key);
        }
        Command::Purge { workspace, key } => {
            storage.purge(&workspace, &key).await?;
            println!("Purged {}/{}", workspace, key);
        }
        Command::DeleteWorkspace { workspace } => {
            state.events.emit(Event::WorkspaceDeleted {
                workspace_id: workspace.clone(),
            });
        }
    }

    let delivered = dispatcher.shutdown().await?;
    tracing::debug!("Dispatcher delivered {} events", delivered);

    Ok(())
}
