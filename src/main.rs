use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use trackhub::cleanup::clean_up_tracks;
use trackhub::database::shared;
use trackhub::metrics::{MetricsSink, NoMetrics, SnapshotMetrics};
use trackhub::sync_client::DnsWorkerDirectory;
use trackhub::sync_server::{start_server, ServerOptions};
use trackhub::{Config, Database, SyncClient, SyncLoop, SyncLoopConfig};

#[derive(Debug, Parser)]
#[command(name = "trackhub")]
#[command(about = "Track and survey answer backend with manager/worker sync")]
struct Cli {
    /// Directory holding config.json, the database and state files
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API for the configured role
    Serve {
        /// Listen port (defaults to server_port from the config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Periodically pull all data from the workers behind one hostname
    Sync {
        /// Hostname resolving to every worker
        #[arg(long)]
        host: Option<String>,
        /// Port the workers listen on
        #[arg(long)]
        port: Option<u16>,
        /// Seconds to sleep between cycles
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },
    /// Delete debug, staging and simulated tracks
    CleanUp,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

fn load_config(config_dir: Option<PathBuf>) -> anyhow::Result<Config> {
    let mut config = Config::new(config_dir).context("failed to load configuration")?;
    config
        .apply_env_overrides()
        .context("invalid environment override")?;
    Ok(config)
}

fn open_database(config: &Config) -> anyhow::Result<Database> {
    let path = config.storage().database_file;
    Database::new(&path).with_context(|| format!("failed to open database {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    trackhub::logging::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { port } => {
            let config = load_config(cli.config_dir)?;
            let db = shared(open_database(&config)?);
            let port = port.unwrap_or_else(|| config.server_port());

            start_server(db, ServerOptions::from_config(&config), port, shutdown_signal()).await?;
        }
        Command::Sync {
            host,
            port,
            interval,
        } => {
            let settings = SyncLoopConfig::new(host, port, Some(interval))?;
            let config = load_config(cli.config_dir)?;
            let storage = config.storage();
            let db = shared(open_database(&config)?);

            let client = SyncClient::new(db, config.sync_key())
                .context("sync_key must be set (config.json or SYNC_KEY) to sync")?;
            let directory = DnsWorkerDirectory::new(settings.host.clone(), settings.port);
            let metrics: Box<dyn MetricsSink> = match &storage.metrics_file {
                Some(path) => Box::new(SnapshotMetrics::new(path)),
                None => Box::new(NoMetrics),
            };

            tracing::info!(
                "Syncing from {}:{} every {} seconds",
                settings.host,
                settings.port,
                settings.interval.as_secs()
            );
            let mut sync_loop = SyncLoop::new(client, directory, metrics, settings.interval);
            if let Some(path) = storage.state_file {
                sync_loop = sync_loop.with_state_file(path);
            }
            sync_loop.run(shutdown_signal()).await?;
        }
        Command::CleanUp => {
            let config = load_config(cli.config_dir)?;
            let db = open_database(&config)?;
            let summary = clean_up_tracks(&db)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
