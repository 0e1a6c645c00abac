//! Crown CLI entry point.

use clap::Parser;

use crown::cli::{commands, Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Commands::Run(args) => commands::run::execute(args, config_path, cli.json).await,
        Commands::Tick(args) => commands::tick::execute(args, config_path, cli.json).await,
        Commands::Crown(args) => commands::crown::execute(args, config_path, cli.json).await,
        Commands::Status => commands::status::execute(config_path, cli.json).await,
        Commands::Config => commands::config::execute(config_path, cli.json),
    };

    if let Err(err) = result {
        crown::cli::handle_error(err, cli.json);
    }
}
