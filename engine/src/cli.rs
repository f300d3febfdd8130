//! CLI interface for Analyst
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Analyst query engine
///
/// Answers questions by delegating to forecasting, document retrieval and
/// structured-data capabilities under a bounded reasoning loop.
#[derive(Parser, Debug)]
#[command(name = "analyst")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Answer one query end to end
    Ask {
        /// The question to answer
        query: String,

        /// Session to continue
        #[arg(short, long, default_value = "default")]
        session: String,
    },

    /// Inspect and maintain the response cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Check providers, database and cache index
    Doctor,
}

/// Response cache actions
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Show index size and record counts
    Stats,

    /// Delete expired records and their index entries
    Prune,

    /// Look up a query without answering it
    Lookup {
        /// The question to look up
        query: String,
    },
}
