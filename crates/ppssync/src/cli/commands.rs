//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand};

/// Run command arguments.
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Stop after this many seconds (default: run until interrupted)
    #[arg(short, long, value_name = "SECS")]
    pub duration: Option<u64>,

    /// Use the software pulse generator instead of the configured source
    #[arg(short, long)]
    pub simulate: bool,

    /// Override the PPS input pin
    #[arg(short, long)]
    pub pin: Option<u32>,

    /// Print status as JSON lines
    #[arg(short, long)]
    pub json: bool,
}

/// Inspect command arguments.
#[derive(Debug, Args)]
pub struct InspectCommand {
    /// Session document to read
    pub file: PathBuf,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,

    /// Also list the most recent N pulses
    #[arg(long, value_name = "N")]
    pub pulses: Option<usize>,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}
