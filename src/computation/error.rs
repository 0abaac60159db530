//! Computation error types

use std::time::Duration;
use thiserror::Error;

/// Error types for computation execution
#[derive(Debug, Error)]
pub enum ComputationError {
    #[error("failed to spawn `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process exited with code {code}: {stderr}")]
    Exit { code: i32, stderr: String },

    #[error("computation output is not valid JSON: {0}")]
    InvalidOutput(#[source] serde_json::Error),

    #[error("failed to encode computation input: {0}")]
    InvalidInput(#[source] serde_json::Error),

    #[error("computation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("unknown function computation `{0}`")]
    UnknownFunction(String),

    #[error("{0}")]
    Failed(String),
}

impl ComputationError {
    /// Failure raised by an in-process computation body
    pub fn failed(message: impl Into<String>) -> Self {
        ComputationError::Failed(message.into())
    }
}
