//! Command-line interface argument parsing.
//!
//! Global flags select the configuration and logging; each subcommand maps
//! to one orchestrator operation.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// livestamp - verifiable proof packets for live streams
///
/// Bundles consensus time, an identity fingerprint and current block hashes
/// into a compact JSON packet that a viewer can re-check later.
///
/// Examples:
///   livestamp generate
///   livestamp generate --user-text "episode 12" --output packet.json
///   livestamp verify --file packet.json
///   livestamp live --interval 2 --count 10
///   livestamp init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Path to configuration file
    ///
    /// If not specified, looks for .livestamp.toml in the current directory
    #[arg(short, long, global = true, value_name = "FILE", env = "LIVESTAMP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Run in quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Identity file to load, or to track when generating a new identity
    #[arg(long, global = true, value_name = "FILE")]
    pub identity_file: Option<PathBuf>,

    /// Chains to include (comma-separated)
    ///
    /// Example: --chains bitcoin,litecoin
    #[arg(long, global = true, value_name = "CHAINS", value_delimiter = ',')]
    pub chains: Option<Vec<String>>,

    /// Output format (text, json)
    #[arg(long, global = true, default_value = "text", value_name = "FORMAT")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Generate a single proof packet
    Generate {
        /// Write the packet JSON to this file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Text to embed as user data
        #[arg(long, value_name = "TEXT")]
        user_text: Option<String>,
    },

    /// Verify a packet against current state
    ///
    /// Exit code 2 when the packet does not verify.
    Verify {
        /// Packet JSON
        #[arg(value_name = "PACKET", required_unless_present = "file", conflicts_with = "file")]
        packet: Option<String>,

        /// Read the packet JSON from a file
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate packets continuously until Ctrl-C
    Live {
        /// Seconds between packets (default: from config)
        #[arg(short, long, value_name = "SECS")]
        interval: Option<f64>,

        /// Stop after this many packets
        #[arg(short = 'n', long, value_name = "N")]
        count: Option<u64>,
    },

    /// Show component statistics after a warm-up
    Status,

    /// Add a file to the identity and save it to the identity file
    AddFile {
        /// File whose content hash becomes part of the identity
        #[arg(value_name = "PATH")]
        path: PathBuf,

        /// Name to track the file under (default: file name)
        #[arg(long, value_name = "ALIAS")]
        alias: Option<String>,
    },

    /// Generate a default .livestamp.toml
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text (default)
    #[default]
    Text,
    /// JSON
    Json,
}

impl Command {
    /// Loop interval requested on the command line, if any.
    pub fn interval(&self) -> Option<f64> {
        match self {
            Command::Live { interval, .. } => *interval,
            _ => None,
        }
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(interval) = self.command.interval() {
            if crate::config::positive_secs(interval).is_none() {
                return Err("Interval must be a positive number of seconds".to_string());
            }
        }

        if let Command::Live { count: Some(0), .. } = self.command {
            return Err("Count must be at least 1".to_string());
        }

        if let Some(ref chains) = self.chains {
            if chains.iter().any(|c| c.trim().is_empty()) {
                return Err("Chain names must not be empty".to_string());
            }
        }

        if let Command::AddFile { ref path, .. } = self.command {
            if !path.is_file() {
                return Err(format!("Not a readable file: {}", path.display()));
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
