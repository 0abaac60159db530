//! CLI output formatting

use crate::core::result::{ComputationResult, ResultDocument};
use crate::execution::PoolEvent;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static FLAG: Emoji<'_, '_> = Emoji("🏁 ", "# ");

/// Create a spinner shown while waiting on a run
pub fn create_spinner(message: impl Into<String>) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner.set_message(message.into());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// One-line description of a result document
pub fn format_result_document(doc: &ResultDocument) -> String {
    let state = doc.core().pipeline_state;
    let status = if doc.core().error.is_some() {
        style("error").red().to_string()
    } else if doc.signals_completion() {
        style("complete").green().to_string()
    } else if state.in_progress {
        style("in progress").yellow().to_string()
    } else {
        style("idle").dim().to_string()
    };

    format!(
        "{} step {} ({})",
        style(doc.id()).cyan(),
        state.step,
        status
    )
}

/// Format a pool event for display, prefixed with the pool's label
pub fn format_pool_event(label: &str, event: &PoolEvent) -> String {
    let label = style(format!("[{}]", label)).dim();
    match event {
        PoolEvent::Ready => format!("{} {} pool ready", label, CHECK),
        PoolEvent::RunStart(doc) => format!(
            "{} {} run {} triggered by {}",
            label,
            ROCKET,
            style(doc.run_id()).bold(),
            style(doc.id()).cyan()
        ),
        PoolEvent::RunEnd(doc) => format!("{} {} {}", label, CHECK, format_result_document(doc)),
        PoolEvent::PipelineInProgress => format!("{} {} pipeline advanced", label, SPINNER),
        PoolEvent::QueueStart(run_id) => {
            format!("{} {} queue {} started", label, INFO, style(run_id).dim())
        }
        PoolEvent::QueueEnd(run_id) => {
            format!("{} {} queue {} drained", label, INFO, style(run_id).dim())
        }
        PoolEvent::ListenerCreated(name) => {
            format!("{} {} listening to {}", label, INFO, style(name).cyan())
        }
        PoolEvent::ComputationComplete { run_id, consortium_id } => format!(
            "{} {} run {} of {} complete",
            label,
            FLAG,
            style(run_id).bold(),
            style(consortium_id).cyan()
        ),
        PoolEvent::ComputationMarkedComplete { run_id, .. } => format!(
            "{} {} run {} marked {}",
            label,
            CHECK,
            style(run_id).bold(),
            style("complete").green()
        ),
        PoolEvent::Error(message) => format!("{} {} {}", label, CROSS, style(message).red()),
    }
}

/// Format a JSON value with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{}... ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}
