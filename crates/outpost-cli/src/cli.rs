use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Output format for CLI commands
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    pub fn is_json(self) -> bool {
        matches!(self, OutputFormat::Json)
    }
}

#[derive(Parser)]
#[command(name = "outpost")]
#[command(version, about = "Outpost - remote management agent")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to ~/.outpost/config.toml)
    #[arg(long, global = true, env = "OUTPOST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Also log to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent service: helper broker plus command loop over stdin/stdout
    Service(ServiceArgs),

    /// Run the helper inside a user login session
    UserHelper(UserHelperArgs),

    /// List login sessions and connected helpers
    Sessions,
}

#[derive(Args, Debug, Default)]
pub struct ServiceArgs {
    /// Broker socket path (overrides config)
    #[arg(long, env = "OUTPOST_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Treat the service as detached from any desktop
    #[arg(long, conflicts_with = "attended")]
    pub detached: bool,

    /// Treat the service as running inside a desktop session
    #[arg(long)]
    pub attended: bool,

    /// Exit once stdin closes and in-flight commands finish
    #[arg(long)]
    pub once: bool,
}

#[derive(Args, Debug, Default)]
pub struct UserHelperArgs {
    /// Broker socket path (overrides config)
    #[arg(long, env = "OUTPOST_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Shell command that performs screenshots and input actions
    #[arg(long, env = "OUTPOST_CAPTURE_COMMAND")]
    pub capture_command: Option<String>,
}
