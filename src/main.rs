//! Tabula CLI - serve a schema-on-demand record store over HTTP

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tabula::dispatcher::Dispatcher;
use tabula::{config, server};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "tabula")]
#[command(version = "0.1.0")]
#[command(about = "Schema-on-demand record store over SQLite")]
#[command(long_about = r#"
Tabula stores one SQLite database per logical database name and lets
callers define record models at runtime over HTTP:

  POST /connect     submit a schema ({dbname, dbtype, db_models})
  POST /store       store one record, nested maps become referenced rows
  POST /bulk_store  store a batch of records
  POST /retrieve    fetch records with equality filters
  GET  /models      list a database's registered models

Example usage:
  tabula init
  tabula serve --port 5000 --storage-dir ./data
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Listen port (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,

        /// Path to the config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory holding the database files (overrides the config file)
        #[arg(short, long)]
        storage_dir: Option<PathBuf>,

        /// Maximum concurrent blocking storage calls (overrides the config file)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Write a default tabula.toml
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve {
            port,
            config,
            storage_dir,
            workers,
        } => {
            let file_config = config::load_config(config.as_deref())?.unwrap_or_default();
            let port = port.unwrap_or(file_config.port);
            let storage_dir = storage_dir.unwrap_or_else(|| file_config.storage_dir.clone());
            let workers = workers.unwrap_or(file_config.max_workers);

            config::ensure_storage_dir(&storage_dir)?;
            tracing::info!(
                storage_dir = %storage_dir.display(),
                workers,
                "starting tabula"
            );

            let dispatcher = Dispatcher::new(storage_dir, workers);
            server::start_server(port, dispatcher).await?;
        }
        Commands::Init { force } => {
            let path = config::default_config_path();
            config::write_config(&path, &config::Config::default(), force)?;
            println!("wrote {}", path.display());
        }
    }

    Ok(())
}
