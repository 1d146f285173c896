//! CLI module for epd-proxy
//!
//! Subcommands:
//! - `epd-proxy serve` - Gate the stages, then run the front-door proxy
//! - `epd-proxy stage` - Run a reference stage server
//! - `epd-proxy validate` - Check a proxy or stage configuration file

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod display;

pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "epd-proxy")]
#[command(about = "Route chat completions through Encode/Prefill/Decode stages")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to a .env file loaded before the configuration
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the proxy in front of the configured stages
    Serve(ServeArgs),

    /// Run a reference stage server with the echo engine
    Stage(StageArgs),

    /// Validate a configuration file
    Validate(ValidateArgs),
}

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Path to the proxy configuration (JSON, JSONC or YAML)
    pub config: PathBuf,

    /// Validate config and show the stage topology without running
    #[arg(long)]
    pub dry_run: bool,

    /// Override the listen host
    #[arg(long, env = "EPD_PROXY_HOST")]
    pub host: Option<String>,

    /// Override the listen port
    #[arg(short, long, env = "EPD_PROXY_PORT")]
    pub port: Option<u16>,
}

/// Arguments for the stage command
#[derive(Parser, Debug)]
pub struct StageArgs {
    /// Path to the stage configuration
    pub config: PathBuf,

    /// Override the listen port
    #[arg(short, long)]
    pub port: Option<u16>,
}

/// Which kind of configuration a file holds
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigKind {
    Proxy,
    Stage,
}

/// Arguments for the validate command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to the configuration file
    pub config: PathBuf,

    /// Kind of configuration
    #[arg(long, value_enum, default_value = "proxy")]
    pub kind: ConfigKind,
}
