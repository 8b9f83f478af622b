//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// StreamRelay - streaming relay between upstream agents and downstream clients
#[derive(Parser)]
#[command(
    name = "sr",
    about = "Relay streamed agent responses to downstream clients over SSE",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the relay (SSE server and agent socket)
    Serve {
        /// Override the listen address from config
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Manage destinations
    Destination {
        #[command(subcommand)]
        command: DestinationCommand,
    },

    /// Manage binding tokens
    Token {
        #[command(subcommand)]
        command: TokenCommand,
    },

    /// Inspect stream traces
    Trace {
        #[command(subcommand)]
        command: TraceCommand,
    },

    /// Print the effective configuration
    Config,
}

/// Destination management subcommands
#[derive(Debug, Subcommand)]
pub enum DestinationCommand {
    /// Create a destination and print its agent token
    Create {
        /// Display name
        name: String,
    },

    /// List all destinations
    List {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Clear a destination's device and user binding
    Unbind {
        /// Destination ID
        id: String,
    },
}

/// Binding token subcommands
#[derive(Debug, Subcommand)]
pub enum TokenCommand {
    /// Issue a single-use binding token for a destination
    Issue {
        /// Destination ID
        destination_id: String,
    },

    /// Delete expired and used tokens
    Sweep,
}

/// Trace inspection subcommands
#[derive(Debug, Subcommand)]
pub enum TraceCommand {
    /// List recent traces
    List {
        /// Only traces with anomalies
        #[arg(short, long)]
        anomalies: bool,

        /// Maximum number of traces
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show one trace with its event timeline
    Show {
        /// Trace ID
        trace_id: String,
    },
}

/// Output format for list commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use text or json", s)),
        }
    }
}

/// Where `sr` writes its log file
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("streamrelay")
        .join("logs")
        .join("streamrelay.log")
}
