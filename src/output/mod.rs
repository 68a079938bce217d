// Output module for converge

pub mod errors;
pub mod json_output;
pub mod terminal;

pub use errors::*;
pub use json_output::*;
pub use terminal::*;

use std::sync::Arc;

use crate::executor::RunResult;
use crate::parser::ast::{Play, Task};

/// Output format for converge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text output with colors
    #[default]
    Text,
    /// Machine-readable JSON output (NDJSON format)
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unknown output format '{}'", other)),
        }
    }
}

/// Sink for run lifecycle events
///
/// Every hook defaults to a no-op. `finish_task` may be called from the
/// async completion listener as well as the controlling task.
pub trait Reporter: Send + Sync {
    fn start_tasks(&self) {}
    fn start_play(&self, _play: &Play) {}
    fn finish_tasks(&self, _history: &[RunResult]) {}

    /// `name` and `args` are the expanded forms
    fn start_task(&self, _task: &Task, _name: &str, _args: &str) {}
    fn finish_task(&self, _result: &RunResult) {}

    fn start_handlers(&self) {}
    fn finish_handlers(&self, _history: &[RunResult]) {}
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {}

/// Build the reporter for a format
pub fn reporter_for(format: OutputFormat, verbose: bool) -> Arc<dyn Reporter> {
    match format {
        OutputFormat::Text => Arc::new(TerminalReporter::new(verbose)),
        OutputFormat::Json => Arc::new(JsonReporter::new()),
    }
}

/// Status word for a finished task
pub fn status_of(result: &RunResult) -> &'static str {
    if result.output.failed() {
        "failed"
    } else if result.output.changed() {
        "changed"
    } else {
        "ok"
    }
}

/// Per-status tally over a history
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Recap {
    pub ok: usize,
    pub changed: usize,
    pub failed: usize,
}

impl Recap {
    pub fn from_history(history: &[RunResult]) -> Self {
        let mut recap = Recap::default();
        for result in history {
            match status_of(result) {
                "failed" => recap.failed += 1,
                "changed" => recap.changed += 1,
                _ => recap.ok += 1,
            }
        }
        recap
    }
}
