use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Value of `--log-title` that disables logging of the successful record
pub const LOG_DISABLED: &str = "None";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ask the model, answering from the call log when possible
    Ask {
        /// Prompt sent as a single user message
        #[arg(short, long)]
        prompt: String,

        /// Return the reply as plain text instead of decoding JSON
        #[arg(long)]
        raw: bool,

        /// Log partition for the successful record ("None" disables it)
        #[arg(short, long, default_value = "default")]
        log_title: String,

        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Verify the configured API key and model
    Check,

    /// Inspect the call log
    Log {
        #[command(subcommand)]
        action: LogAction,
    },
}

#[derive(Subcommand)]
pub enum LogAction {
    /// List partitions with record counts
    Partitions,

    /// Print the records of one partition
    Show {
        /// Partition name
        #[arg(short, long, default_value = "default")]
        partition: String,
    },
}

impl Commands {
    /// Partition named by `--log-title`, or `None` when disabled
    pub fn log_partition(log_title: &str) -> Option<String> {
        if log_title == LOG_DISABLED {
            None
        } else {
            Some(log_title.to_string())
        }
    }
}
