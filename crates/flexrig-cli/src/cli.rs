//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "flexrig")]
#[command(author, version, about = "Operator CLI for the flexrig capture backbone", long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the rig configuration file
    #[arg(short, long, global = true, env = "FLEXRIG_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan for rig sensors and list what advertises
    Scan {
        /// How long to listen for advertisements, in seconds
        #[arg(short, long, default_value = "5")]
        timeout: u64,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// List known sensors and rig state without scanning
    Devices {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Connect the rig and synchronize sensor clocks
    Sync,
    /// Connect the full rig, sync clocks, and record a set
    Record {
        /// Session identifier
        #[arg(long)]
        session: String,
        /// Exercise identifier
        #[arg(long)]
        exercise: String,
        /// Set number within the session
        #[arg(long, default_value = "1")]
        set: u32,
        /// Recording duration in seconds
        #[arg(short, long, default_value = "30")]
        duration: u64,
    },
    /// Stream live knee angles to stdout without recording
    Watch {
        /// How long to watch, in seconds (0 = until interrupted)
        #[arg(short, long, default_value = "0")]
        duration: u64,
    },
    /// Identify a physical sensor by shaking it
    Locate {
        /// How long to stay in locate mode, in seconds
        #[arg(short, long, default_value = "20")]
        duration: u64,
    },
}
