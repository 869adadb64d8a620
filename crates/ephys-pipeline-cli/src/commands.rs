use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "ephys-pipeline")]
#[command(about = "Electrophysiology LFP and spike-sorting pipeline", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Catalog raw acquisition files under the configured roots
    Catalog,
    /// Import probes, electrode configs, sessions and tasks from a JSON manifest
    Import {
        manifest: PathBuf,
    },
    /// Register a sorting parameter set from a JSON file
    AddParams {
        file: PathBuf,
    },
    /// Store the raw header of every session that lacks one
    SessionInfo,
    /// Extract LFP for every pending session
    Lfp,
    /// Run pending sorting stages, then aggregate units, metrics and waveforms
    Sort,
    /// Show what the next run would process
    Pending,
    /// Print configuration values
    PrintConfig,
    /// Truncate all database tables
    TruncateDb,
}
