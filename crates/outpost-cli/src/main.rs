mod cli;
mod commands;
mod error;
mod logging;
mod output;
mod tools;

use clap::Parser;
use cli::{Cli, Commands};
use outpost_core::config::AgentConfig;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AgentConfig::load_from_path(path),
        None => AgentConfig::load(),
    };

    let log_file = match cli.command {
        Commands::UserHelper(_) => "outpost-helper.log",
        _ => "outpost.log",
    };
    let _guard = logging::init(&config.log_level, cli.verbose, log_file);

    let result = match cli.command {
        Commands::Service(args) => commands::service::run(config, args).await,
        Commands::UserHelper(args) => commands::user_helper::run(config, args).await,
        Commands::Sessions => commands::sessions::run(config, cli.format).await,
    };

    if let Err(err) = result {
        error::handle_error(err);
    }
}
