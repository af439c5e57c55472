//! Toolwright CLI: the main entry point.
//!
//! Commands:
//! - `parse-action`: Parse text-marker actions out of model output
//! - `events`: Validate and summarize a JSONL event log
//! - `config`: Show, locate or validate the configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "toolwright",
    about = "Toolwright: agent execution runtime",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of ~/.toolwright/config.toml
    #[arg(long, global = true, env = "TOOLWRIGHT_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse `Action: name(key='value')` markers from model output
    ParseAction {
        /// Text to parse (read from stdin when omitted)
        text: Option<String>,

        /// Coordinate scale factors as WIDTH,HEIGHT (defaults to the config)
        #[arg(short, long)]
        factors: Option<String>,
    },

    /// Validate and summarize a JSONL event log
    Events {
        /// Path to the log
        path: PathBuf,

        /// Print one line per valid event
        #[arg(short, long)]
        list: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show {
        /// Print the built-in defaults instead
        #[arg(long)]
        default: bool,
    },
    /// Print the config file path
    Path,
    /// Load and validate the configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();
    match cli.command {
        Commands::ParseAction { text, factors } => {
            commands::parse_action::run(text, factors, config).await?
        }
        Commands::Events { path, list } => commands::events::run(&path, list).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show { default } => commands::config_cmd::show(config, default).await?,
            ConfigAction::Path => commands::config_cmd::path(config).await?,
            ConfigAction::Validate => commands::config_cmd::validate(config).await?,
        },
    }

    Ok(())
}
