//! Command-line interface for batch contributor statistics.
#![forbid(unsafe_code)]

use clap::{Parser, Subcommand};

mod error;
mod stats;

pub use error::CliError;
pub(crate) use stats::{StatsArgs, run_stats};

const ARG_INPUT_DIR: &str = "input-dir";
const ARG_OUTPUT_DIR: &str = "output-dir";
const ARG_STORE_DIR: &str = "store-dir";
const ARG_DELIMITER: &str = "delimiter";
const ARG_LAYOUT: &str = "layout";
const ARG_MODE: &str = "mode";
const ENV_INPUT_DIR: &str = "USERSTATS_CMDS_STATS_INPUT_DIR";
const ENV_OUTPUT_DIR: &str = "USERSTATS_CMDS_STATS_OUTPUT_DIR";
const ENV_STORE_DIR: &str = "USERSTATS_CMDS_STATS_STORE_DIR";

/// Run the userstats CLI with the current process arguments and environment.
pub fn run() -> Result<(), CliError> {
    let cli = Cli::try_parse().map_err(CliError::ArgumentParsing)?;
    match cli.command {
        Command::Stats(args) => {
            run_stats(args)?;
        }
    }
    Ok(())
}

#[derive(Debug, Parser)]
#[command(
    name = "userstats",
    about = "Per-contributor statistics from OpenStreetMap history archives",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Aggregate every archive in a directory into one statistics table each.
    Stats(StatsArgs),
}

#[cfg(test)]
mod tests;
