use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "fidelius", about = "Fidelius: one-time encrypted secret sharing", version)]
struct Cli {
    /// Directory holding fidelius.db (default: $FIDELIUS_DATA_DIR or the platform data dir)
    #[arg(long, env = "FIDELIUS_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Fidelius HTTP server
    Serve {
        /// Port to listen on (default: $FIDELIUS_PORT or 8080)
        #[arg(long, env = "FIDELIUS_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $FIDELIUS_HOST or 0.0.0.0)
        #[arg(long, env = "FIDELIUS_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Delete all expired secrets from the local store and exit
    Sweep,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("FIDELIUS_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port, cli.data_dir).await,
        Commands::Sweep => cmd_sweep(cli.data_dir),
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16, data_dir: Option<PathBuf>) -> Result<()> {
    let cfg = fidelius_server::ServerConfig {
        host,
        port,
        data_dir,
        ..Default::default()
    };

    fidelius_server::run(cfg).await
}

/// Offline sweep. Run it while the server is stopped: redb allows one
/// process per database file.
fn cmd_sweep(data_dir: Option<PathBuf>) -> Result<()> {
    let cfg = fidelius_server::ServerConfig {
        data_dir,
        ..Default::default()
    };
    cfg.validate()?;
    let data_dir = fidelius_server::resolve_data_dir(cfg.data_dir.as_ref())?;
    let store = fidelius_server::open_store(&data_dir, &cfg)?;

    let removed = store.sweep()?;
    let remaining = store.len()?;
    println!("swept {removed} expired secret(s), {remaining} remaining");
    Ok(())
}
