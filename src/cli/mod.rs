//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{NodeCommand, SimulateCommand, ValidateCommand};
use std::ffi::OsString;

/// Coordinate decentralized computation runs across a consortium
#[derive(Debug, Parser, Clone)]
#[command(name = "consortium-pipeline")]
#[command(author = "Consortium Pipeline Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Run decentralized multi-party computation pipelines", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Validate a computation definition
    Validate(ValidateCommand),

    /// Run a participant node
    Local(NodeCommand),

    /// Run the aggregator node
    Remote(NodeCommand),

    /// Run one participant pool per user and an aggregator in-process
    Simulate(SimulateCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
