//! Conductor CLI entry point.
//!
//! Binary name: `conductor`
//!
//! Parses CLI arguments, loads configuration, initializes tracing and the
//! SQLite store, then dispatches to the command handler.

mod builtin;
mod cli;
mod state;

use clap::Parser;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(conductor_infra::config::default_data_dir);
    let mut config = conductor_infra::config::load_engine_config(&data_dir).await;

    // Verbosity flags override the configured level
    config.logging.level = match cli.verbose {
        0 if cli.quiet => "error".to_string(),
        0 => config.logging.level,
        1 => "info,conductor_core=debug".to_string(),
        _ => "trace".to_string(),
    };
    conductor_observe::tracing_setup::init_tracing(&config.logging)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = match cli.command {
        Commands::Validate { file } => cli::workflow::validate(&file, cli.json),
        Commands::Patterns => cli::pattern::list_patterns(&data_dir, cli.json),
        command => {
            let state = AppState::init(data_dir, config).await?;
            match command {
                Commands::Run(args) => cli::workflow::run(&state, args, cli.json, cli.quiet).await,
                Commands::Status { id } => cli::workflow::status(&state, &id, cli.json).await,
                Commands::List { limit } => cli::workflow::list(&state, limit, cli.json).await,
                Commands::Validate { .. } | Commands::Patterns => Ok(()),
            }
        }
    };

    conductor_observe::tracing_setup::shutdown_tracing();
    result
}
