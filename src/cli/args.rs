//! Command line argument parsing for Pilum CLI using clap.

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Pilum - write buffering and segment flushing for vector storage
#[derive(Parser, Debug, Clone)]
#[command(name = "pilum")]
#[command(about = "Buffer vectors in memory segments and flush them as segment files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct PilumArgs {
    /// Verbosity level (0=quiet, 1=normal, 2=verbose, 3=debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (overrides verbose)
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human")]
    pub output_format: OutputFormat,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

impl PilumArgs {
    /// Get the effective verbosity level
    pub fn verbosity(&self) -> u8 {
        if self.quiet {
            0
        } else {
            match self.verbose {
                0 => 1, // Default to normal
                n => n,
            }
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Generate random vectors, buffer them and flush segment files
    Ingest(IngestArgs),

    /// Read a flushed segment file back
    Inspect(InspectArgs),

    /// Show the persisted snapshot manifest
    Manifest(ManifestArgs),
}

/// Arguments for ingesting generated vectors
#[derive(Parser, Debug, Clone)]
pub struct IngestArgs {
    /// Data directory holding the manifest and segment files
    #[arg(value_name = "DATA_DIR")]
    pub data_dir: PathBuf,

    /// Collection name, created if missing
    #[arg(short, long, default_value = "demo")]
    pub collection: String,

    /// Vector dimension used when creating the collection
    #[arg(short, long, default_value = "128")]
    pub dimension: usize,

    /// Number of vectors to generate
    #[arg(short = 'n', long, default_value = "10000")]
    pub count: usize,

    /// Memory budget per segment in bytes (overrides the config file)
    #[arg(short, long, env = "PILUM_SEGMENT_BYTES")]
    pub budget: Option<usize>,

    /// Memory segment configuration file (JSON)
    #[arg(long, value_name = "CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Delete every n-th generated id before flushing
    #[arg(long, value_name = "N")]
    pub delete_every: Option<usize>,

    /// WAL sequence number recorded on the flushed files
    #[arg(long, default_value = "0")]
    pub lsn: u64,

    /// Seed for the vector generator
    #[arg(long)]
    pub seed: Option<u64>,

    /// Flush full segments on a background thread
    #[arg(long)]
    pub background: bool,
}

/// Arguments for inspecting a segment file
#[derive(Parser, Debug, Clone)]
pub struct InspectArgs {
    /// Data directory holding the segment file
    #[arg(value_name = "DATA_DIR")]
    pub data_dir: PathBuf,

    /// Segment file name, e.g. segment_3.pseg
    #[arg(value_name = "FILE")]
    pub file: String,

    /// Number of leading rows to show
    #[arg(short, long, default_value = "10")]
    pub rows: usize,
}

/// Arguments for showing the manifest
#[derive(Parser, Debug, Clone)]
pub struct ManifestArgs {
    /// Data directory holding the manifest
    #[arg(value_name = "DATA_DIR")]
    pub data_dir: PathBuf,

    /// Print every snapshot in full instead of a summary
    #[arg(long)]
    pub full: bool,
}

/// Output format options
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ingest() {
        let args = PilumArgs::parse_from([
            "pilum", "-vv", "ingest", "/tmp/data", "--dimension", "4", "-n", "100", "--budget",
            "1024",
        ]);
        assert_eq!(args.verbosity(), 2);
        match args.command {
            Command::Ingest(ingest) => {
                assert_eq!(ingest.dimension, 4);
                assert_eq!(ingest.count, 100);
                assert_eq!(ingest.budget, Some(1024));
                assert_eq!(ingest.collection, "demo");
                assert!(!ingest.background);
            }
            _ => panic!("expected ingest"),
        }
    }

    #[test]
    fn test_quiet_overrides_verbose() {
        let args = PilumArgs::parse_from(["pilum", "-q", "-vvv", "manifest", "/tmp/data"]);
        assert_eq!(args.verbosity(), 0);
    }

    #[test]
    fn test_json_format() {
        let args = PilumArgs::parse_from([
            "pilum", "--format", "json", "inspect", "/tmp/data", "segment_1.pseg",
        ]);
        assert_eq!(args.output_format, OutputFormat::Json);
    }
}
