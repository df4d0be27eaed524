//! CLI definitions for homa-probe.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "homa-probe",
    version,
    about = "Loopback driver for the Homa transport engine\n\nDrives a client and server transport over real UDP sockets on loopback and reports whether each end-to-end scenario behaved as the protocol design requires.",
    long_about = None
)]
pub struct Cli {
    /// Path to homa-probe.toml config file
    #[clap(long, short, default_value = "homa-probe.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the end-to-end scenarios and output a structured report
    Run {
        /// Write JSON report to this file (default: stdout)
        #[clap(long)]
        output: Option<PathBuf>,
    },

    /// Print an example homa-probe.toml to stdout
    Init,
}
