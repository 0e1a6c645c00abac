//! Command-line interface.

pub mod commands;
pub mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::adapters::dispatch::CommandDispatcher;
use crate::adapters::notify::notifier_from_config;
use crate::adapters::sqlite::{initialize_database, SqliteStore};
use crate::application::SchedulerRuntime;
use crate::domain::models::Config;
use crate::domain::ports::Notifier;
use crate::infrastructure::config::ConfigLoader;
use crate::infrastructure::logging::{LogConfig, LoggerImpl};

#[derive(Parser, Debug)]
#[command(
    name = "crown",
    about = "Autonomous task scheduler with a supervisory loop",
    version
)]
/// Top-level arguments.
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,

    /// Output as JSON
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Config file to read instead of .crown/config.yaml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the tick loop and the crown loop until interrupted
    Run(commands::run::RunArgs),
    /// Run a single tick
    Tick(commands::tick::TickArgs),
    /// Run a single crown pass
    Crown(commands::crown::CrownArgs),
    /// Show agents, task counts and wave runs
    Status,
    /// Print the effective configuration
    Config,
}

/// Print the error in the requested format and exit non-zero.
pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let body = serde_json::json!({
            "success": false,
            "error": format!("{err:#}"),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&body).unwrap_or_default()
        );
    } else {
        eprintln!("Error: {err:#}");
    }
    std::process::exit(1);
}

/// Load the merged configuration, from `path` when given.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

/// Install logging for a command. JSON output keeps stdout for the result.
pub fn init_logging(config: &Config, json_mode: bool) -> Result<LoggerImpl> {
    let mut log_config = LogConfig::from(&config.logging);
    log_config.enable_stdout = !json_mode;
    LoggerImpl::init(&log_config)
}

/// Open and migrate the configured database.
pub async fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let pool = initialize_database(&config.database)
        .await
        .with_context(|| format!("Failed to open database at {}", config.database.path))?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

/// Wire the runtime against the configured database, worker command and
/// notification sink.
pub async fn build_runtime(config: &Config) -> Result<SchedulerRuntime> {
    let store = open_store(config).await?;
    let dispatcher = Arc::new(CommandDispatcher::new(config.dispatch.clone()));
    let notifier: Arc<dyn Notifier> = Arc::from(
        notifier_from_config(&config.notifications)
            .context("Failed to configure notifications")?,
    );
    Ok(SchedulerRuntime::new(config, store, dispatcher, notifier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["crown", "tick", "--json", "--dry-run"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Tick(args) => assert!(args.dry_run),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_config_path_flag() {
        let cli = Cli::try_parse_from(["crown", "--config", "/tmp/c.yaml", "status"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.yaml")));
        assert!(matches!(cli.command, Commands::Status));
    }
}
