mod commands;
mod input;
mod stdout;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use libdeck::DeckConfig;

#[derive(Parser)]
#[command(name = "deck", about = "Resumable terminal sessions and execution updates for the deck console")]
struct Cli {
    /// Config file (defaults to $XDG_CONFIG_HOME/deck/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend base URL, overriding the config file
    #[arg(long, global = true)]
    server: Option<String>,

    /// Directory holding the local state database
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resume the newest terminal, or open a new one, and attach to it
    Shell {
        /// Working directory for a new session
        #[arg(long)]
        cwd: Option<String>,
    },

    /// List terminal sessions remembered for this machine
    Sessions,

    /// Restore every remembered terminal and close it remotely
    CloseAll,

    /// Print a line whenever an execution succeeds or fails
    Watch,

    /// Forget a remembered terminal without contacting the backend
    Forget {
        /// Handle id as printed by `deck sessions`
        handle: String,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<DeckConfig> {
    let mut config = match &cli.config {
        Some(path) => DeckConfig::load_from(path),
        None => DeckConfig::load(),
    }
    .context("failed to load config")?;
    if let Some(server) = &cli.server {
        config.server_url = server.clone();
    }
    if let Some(state_dir) = &cli.state_dir {
        config.state_dir = state_dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout belongs to the attached terminal; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deck=info,libdeck=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Shell { cwd } => commands::shell(&config, cwd).await,
        Commands::Sessions => commands::sessions(&config),
        Commands::CloseAll => commands::close_all(&config).await,
        Commands::Watch => commands::watch(&config).await,
        Commands::Forget { handle } => commands::forget(&config, &handle),
    }
}
