//! homa-probe — Homa transport engine loopback driver.
//!
//! Drives a client and server `homa::Transport` over real UDP sockets on
//! loopback and reports whether each end-to-end scenario behaved as the
//! protocol design requires. Run `homa-probe --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod scenarios;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let example = config::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        Commands::Run { output } => {
            if !cli.config.exists() {
                std::fs::write(&cli.config, b"")?;
                eprintln!(
                    "Created '{}' with engine defaults — edit it to retune the scheduler.",
                    cli.config.display()
                );
            }
            let cfg = config::load(&cli.config)?;
            scenarios::run_all(&cfg, output)?;
        }
    }

    Ok(())
}
