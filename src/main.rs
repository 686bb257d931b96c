use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use flowboard::board_config::{CliOverrides, FlowboardConfig, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "flowboard")]
#[command(version, about = "Workflow board sync engine: optimistic moves with realtime merge")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Project id (overrides FLOWBOARD_PROJECT and flowboard.toml)
    #[arg(long, global = true)]
    pub project: Option<String>,

    /// Discipline id (overrides FLOWBOARD_DISCIPLINE and flowboard.toml)
    #[arg(long, global = true)]
    pub discipline: Option<String>,

    /// Board API base URL (overrides FLOWBOARD_BASE_URL and flowboard.toml)
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch and print the board for the selected scope
    Board {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Move an item between columns and wait for the write to settle
    Move {
        item: String,
        from: String,
        to: String,
        /// Destination index within the target column
        #[arg(short, long, default_value = "0")]
        index: usize,
    },
    /// Open the board and print every change as it happens
    Watch {
        /// Stop after this many merged changes
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show the column/status mapping tables
    Columns,
    /// Run the engine against an in-memory backend
    Demo,
    /// View or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default flowboard.toml file
    Init,
}

fn init_tracing(format: LogFormat, verbose: bool) {
    let filter = EnvFilter::try_from_env("FLOWBOARD_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "flowboard=debug,info"
        } else {
            "flowboard=info,warn"
        })
    });

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Compact => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let overrides = CliOverrides {
        base_url: cli.base_url.clone(),
        project: cli.project.clone(),
        discipline: cli.discipline.clone(),
        verbose: cli.verbose,
    };
    let config = FlowboardConfig::with_cli_args(project_dir.clone(), overrides.clone());
    init_tracing(
        config
            .as_ref()
            .map(FlowboardConfig::log_format)
            .unwrap_or_default(),
        cli.verbose,
    );

    match &cli.command {
        Commands::Columns => cmd::cmd_columns(),
        Commands::Demo => cmd::cmd_demo().await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, overrides, command.clone())?,
        Commands::Board { json } => cmd::cmd_board(&config?, *json).await?,
        Commands::Move {
            item,
            from,
            to,
            index,
        } => cmd::cmd_move(&config?, item, from, to, *index).await?,
        Commands::Watch { limit } => cmd::cmd_watch(&config?, *limit).await?,
    }

    Ok(())
}
