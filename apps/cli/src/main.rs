//! # wellbridge
//!
//! Developer binary for the Wellness Bridge. Runs the device-side handoff
//! and health sync from a terminal against a simulated health platform.
//!
//! ## Usage
//! ```bash
//! # Write bridge.toml with a fresh device id
//! wellbridge config init
//!
//! # Link this device; prints the handoff URL and the manual code
//! wellbridge connect
//!
//! # Full offline run: simulated hub validates the token by itself
//! wellbridge --simulate connect
//!
//! # Link with a code shown on another device
//! wellbridge connect --code user-42/TKN9-QX7A
//!
//! # Inspect and forget the link
//! wellbridge status --json
//! wellbridge token
//! wellbridge disconnect
//!
//! # Ask for health permissions by identifier
//! wellbridge permissions weight steps physical_activity
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

mod commands;
mod console;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::commands::Context;

#[derive(Parser)]
#[command(
    name = "wellbridge",
    version,
    about = "Wellness Bridge device runtime",
    long_about = "Links this device to the Wellness Hub and syncs health data from a simulated health platform."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file (defaults to bridge.toml in the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database (defaults to bridge.db in the platform data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Simulate the hub and the realtime channel
    #[arg(long, global = true)]
    simulate: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Link this device to the hub and run the first sync
    Connect {
        /// Reconnect code (`user/TOKEN`) instead of a browser handoff
        #[arg(long)]
        code: Option<String>,

        /// Hide Digital Twin progress; the process still waits for the run
        #[arg(long)]
        detach: bool,
    },

    /// Show the connection and the latest sync summaries
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Show the outstanding connection code
    Token,

    /// Forget the linked device
    Disconnect,

    /// Request health permissions by identifier
    Permissions {
        /// Identifiers such as `weight`, `steps` or `physical_activity`
        #[arg(required = true)]
        types: Vec<String>,

        /// Only report the current grants
        #[arg(long)]
        check: bool,
    },

    /// Configuration file management
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write a default config with a new device id
    Init {
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli = Cli::parse();
    let ctx = Context {
        config_path: cli.config,
        db_path: cli.db,
        simulate: cli.simulate,
    };

    let result = match cli.command {
        Command::Connect { code, detach } => commands::connect(&ctx, code, detach).await,
        Command::Status { json } => commands::status(&ctx, json).await,
        Command::Token => commands::token(&ctx).await,
        Command::Disconnect => commands::disconnect(&ctx).await,
        Command::Permissions { types, check } => commands::permissions(&ctx, types, check).await,
        Command::Config { action } => match action {
            ConfigCommand::Init { force } => commands::config_init(&ctx, force),
            ConfigCommand::Show => commands::config_show(&ctx),
        },
    };

    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    result.map_err(Into::into)
}
