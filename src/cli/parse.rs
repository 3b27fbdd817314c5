//! CLI parse: clap types for netricsa. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Netricsa CLI - drive the persona job core from a terminal
#[derive(Parser, Debug)]
#[command(name = "netricsa")]
#[command(about = "Stream persona replies through the per-channel job queue")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory (where config/ lives)
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (default: off)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stream one reply to a prompt, as if posted in a channel
    Ask {
        /// Channel the message is posted in
        #[arg(long, default_value = "cli")]
        channel: String,
        /// Author of the message
        #[arg(long, default_value = "cli-user")]
        user: String,
        /// Prompt text
        prompt: String,
    },
    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the effective configuration
    Validate,
}
