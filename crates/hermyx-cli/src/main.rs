//! Hermyx command-line interface.
//!
//! Three subcommands drive the proxy's lifecycle:
//!
//! - `hermyx up` — start the proxy from a config file.
//! - `hermyx down` — stop a running instance via its PID file.
//! - `hermyx init` — scaffold a defaulted config file.
//!
//! Every subcommand accepts `--config <path>` and defaults to
//! `./hermyx.config.yaml`. Exit code is 0 on success and 1 on any error.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "hermyx")]
#[command(about = "Blazing fast reverse proxy with smart caching and rate limiting")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Hermyx reverse proxy
    Up {
        /// Path to the hermyx config YAML
        #[arg(long, default_value = "hermyx.config.yaml")]
        config: PathBuf,
    },

    /// Stop a running Hermyx instance via its PID file
    Down {
        /// Path to the hermyx config YAML
        #[arg(long, default_value = "hermyx.config.yaml")]
        config: PathBuf,
    },

    /// Write a defaulted config file, creating parent directories
    Init {
        /// Path the config YAML is written to
        #[arg(long, default_value = "hermyx.config.yaml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Up { config } => commands::up(&config).await,
        Commands::Down { config } => commands::down(&config),
        Commands::Init { config } => commands::init(&config),
    }
}
