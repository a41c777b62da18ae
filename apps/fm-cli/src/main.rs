//! # fm-cli
//!
//! Operator CLI for the Foreman board.
//!
//! Thin wrapper over the state engine for humans poking at a board:
//! - `fm init` — lay out a new board directory
//! - `fm project create/list/show/transition/ready/approve` — manage projects
//! - `fm task claim/complete/fail` — drive cards the way a worker would
//! - `fm events tail/follow` — read the change feed
//!
//! The engine itself never parses arguments or prints; everything
//! user-facing lives here.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fm_engine::EngineConfig;
use tracing_subscriber::EnvFilter;

/// Foreman board CLI — inspect and drive orchestrated work.
#[derive(Parser)]
#[command(name = "fm", version, about)]
struct Cli {
    /// Board root directory (defaults to current directory).
    #[arg(long, default_value = ".")]
    board: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the board directory layout.
    Init,
    /// Manage projects.
    Project {
        #[command(subcommand)]
        command: commands::project::ProjectCommands,
    },
    /// Drive task cards the way a worker would.
    Task {
        #[command(subcommand)]
        command: commands::task::TaskCommands,
    },
    /// Read the change event feed.
    Events {
        #[command(subcommand)]
        command: commands::events::EventCommands,
    },
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let board = cli.board.canonicalize().unwrap_or(cli.board);

    // A foreman.toml next to the board wins over the standard layout.
    let config_path = board.join("foreman.toml");
    let config = if config_path.exists() {
        EngineConfig::load(&config_path)?
    } else {
        EngineConfig::for_root(&board)
    };

    match &cli.command {
        Commands::Init => commands::board::init(&config),
        Commands::Project { command } => commands::project::execute(command, &config),
        Commands::Task { command } => commands::task::execute(command, &config),
        Commands::Events { command } => commands::events::execute(command, &config),
    }
}
