//! Subprocess computations - runs an external command per step

use crate::computation::ComputationError;
use serde_json::Value;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, warn};

/// Computation that shells out to an external program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandComputation {
    /// Program to execute (e.g., "python", "/usr/local/bin/ridge")
    cmd: String,

    /// Arguments placed before `--run <input>`
    args: Vec<String>,
}

impl CommandComputation {
    pub fn new(cmd: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args,
        }
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Execute the command with `input` serialized as JSON
    ///
    /// Calls `<cmd> <args...> --run <input-json>` in `cwd` and parses stdout.
    ///
    /// # Returns
    /// The parsed JSON output, or `Value::Null` when stdout is empty
    ///
    /// # Errors
    /// Returns `ComputationError` if:
    /// - The command cannot be spawned
    /// - The command exits with a non-zero status
    /// - Stdout is not valid JSON
    pub async fn execute(
        &self,
        input: &Value,
        cwd: &Path,
        verbose: bool,
    ) -> Result<Value, ComputationError> {
        let payload = serde_json::to_string(input).map_err(ComputationError::InvalidInput)?;

        debug!(
            "Spawning `{}` in {} with {} bytes of input",
            self.cmd,
            cwd.display(),
            payload.len()
        );

        let output = Command::new(&self.cmd)
            .args(&self.args)
            .arg("--run")
            .arg(&payload)
            .current_dir(cwd)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ComputationError::Spawn {
                cmd: self.cmd.clone(),
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            if verbose {
                warn!(
                    "Command failed to run: {} {}\nstdout:\n{}\nstderr:\n{}",
                    self.cmd,
                    self.args.join(" "),
                    String::from_utf8_lossy(&output.stdout),
                    stderr.trim()
                );
            }
            return Err(ComputationError::Exit {
                code,
                stderr: stderr.trim().to_string(),
            });
        }

        if verbose && !stderr.trim().is_empty() {
            warn!("{} stderr: {}", self.cmd, stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.is_empty() {
            return Ok(Value::Null);
        }

        debug!("`{}` returned {} bytes of output", self.cmd, stdout.len());

        serde_json::from_str(&stdout).map_err(ComputationError::InvalidOutput)
    }
}
