//! Run state models shared by pipelines and result documents

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error as StdError;

/// Cursor state of a pipeline, persisted on every result patch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    /// Index of the current computation (0-based)
    #[serde(default)]
    pub step: usize,

    /// Whether another round is about to run
    #[serde(default)]
    pub in_progress: bool,
}

impl PipelineState {
    pub fn new(step: usize, in_progress: bool) -> Self {
        Self { step, in_progress }
    }
}

/// Structured error recorded on a result document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Top-level error message
    pub message: String,

    /// Source chain of the error, one cause per line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Participant that raised the error, set when copied into an aggregate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            username: None,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Capture an error and its `source()` chain
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut current = err.source();
        while let Some(cause) = current {
            causes.push(format!("caused by: {}", cause));
            current = cause.source();
        }

        Self {
            message: err.to_string(),
            stack: if causes.is_empty() {
                None
            } else {
                Some(causes.join("\n"))
            },
            username: None,
        }
    }
}

/// Loose truthiness used by gates and completion flags.
///
/// `null`, `false`, `0`, and `""` are falsy; every array and object is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Whether a payload carries `complete: <truthy>`
pub fn signals_complete(data: &Value) -> bool {
    data.get("complete").map(is_truthy).unwrap_or(false)
}
