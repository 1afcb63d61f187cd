use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, prelude::*};

use gamenest::config::GamenestConfig;

mod cmd;

const DEFAULT_LOG_FILTER: &str = "gamenest=info,tower_http=info";

#[derive(Parser)]
#[command(name = "gamenest")]
#[command(version, about = "Build service that turns pushed game repositories into web exports")]
pub struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to a gamenest.toml. Defaults to .gamenest/gamenest.toml when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the webhook, API and realtime server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (bind all interfaces, permissive CORS)
        #[arg(long)]
        dev: bool,
    },
    /// Create the build database and exit
    InitDb {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Manage games linked to repositories
    Game {
        #[command(subcommand)]
        command: GameCommands,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum GameCommands {
    /// Link a repository to a new game
    Link {
        /// Game title
        #[arg(long)]
        title: String,

        /// Repository id assigned by the hosting provider
        #[arg(long)]
        repo_id: i64,

        /// Repository web URL (clone URL is <url>.git)
        #[arg(long)]
        url: String,

        /// Branch whose pushes trigger builds
        #[arg(long, default_value = "main")]
        branch: String,
    },
    /// List builds for a game, newest first
    Builds {
        /// Game id
        game_id: i64,
    },
}

#[derive(Subcommand, Clone, Copy)]
pub enum ConfigCommands {
    /// Show effective configuration with secrets masked
    Show,
    /// Report settings that prevent builds or connections
    Validate,
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose {
        "gamenest=debug,tower_http=debug"
    } else {
        DEFAULT_LOG_FILTER
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal; everything can come from the real environment.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let base_dir = std::env::current_dir()?;
    let config = GamenestConfig::resolve(cli.config.as_deref(), &base_dir)?;

    match &cli.command {
        Commands::Serve { port, db_path, dev } => {
            cmd::cmd_serve(config, *port, db_path.clone(), *dev).await?;
        }
        Commands::InitDb { db_path } => cmd::cmd_init_db(&config, db_path.clone())?,
        Commands::Game { command } => cmd::cmd_game(&config, command.clone())?,
        Commands::Config { command } => {
            cmd::cmd_config(&config, cli.config.as_deref(), &base_dir, *command)?
        }
    }

    Ok(())
}
