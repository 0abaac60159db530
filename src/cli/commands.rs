//! CLI command definitions

use clap::Args;
use std::path::PathBuf;

/// Validate a computation definition
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to computation definition YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Output the participant-facing document as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run a participant or aggregator node
#[derive(Debug, Args, Clone)]
pub struct NodeCommand {
    /// Path to node configuration YAML file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Username override for participant nodes
    #[arg(short, long)]
    pub username: Option<String>,

    /// Only listen to these consortium ids (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub listen_to: Vec<String>,

    /// SQLite file override
    #[arg(long)]
    pub store: Option<PathBuf>,
}

/// Simulate a full run in-process
#[derive(Debug, Args, Clone)]
pub struct SimulateCommand {
    /// Participants (comma separated)
    #[arg(long, value_delimiter = ',', default_value = "alice,bob")]
    pub users: Vec<String>,

    /// Value each participant contributes; `user=value`
    #[arg(long = "value", value_parser = parse_key_value)]
    pub values: Vec<(String, String)>,

    /// Keep participants in lockstep with the group-step plugin
    #[arg(long)]
    pub group_step: bool,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    /// Print the final aggregate document as JSON
    #[arg(long)]
    pub json: bool,
}

impl SimulateCommand {
    /// Value contributed by `user`, defaulting to its position plus one
    pub fn value_for(&self, user: &str, index: usize) -> f64 {
        self.values
            .iter()
            .rev()
            .find(|(name, _)| name == user)
            .and_then(|(_, value)| value.parse().ok())
            .unwrap_or((index + 1) as f64)
    }
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 {
        return Err(format!("Invalid key=value pair: {}", s));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}
