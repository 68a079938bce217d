// JSON output for structured logging

use serde_json::json;

use super::{status_of, Recap, Reporter};
use crate::executor::RunResult;
use crate::parser::ast::{Play, Task};

/// NDJSON event stream on stdout, one object per lifecycle event
#[derive(Debug, Default)]
pub struct JsonReporter;

impl JsonReporter {
    pub fn new() -> Self {
        JsonReporter
    }

    fn emit_json(&self, event: &serde_json::Value) {
        println!("{}", event);
    }
}

/// Event describing a finished task
pub fn task_event(result: &RunResult) -> serde_json::Value {
    let mut event = json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "event": "task_complete",
        "task": result.task.name,
        "command": result.task.command,
        "status": status_of(result),
        "duration_ms": result.runtime.as_millis(),
    });

    if let Ok(data) = serde_json::to_value(result.output.to_value()) {
        event["result"] = data;
    }

    event
}

/// Event summarizing a history
pub fn recap_event(name: &str, history: &[RunResult]) -> serde_json::Value {
    let recap = Recap::from_history(history);
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "event": name,
        "ok": recap.ok,
        "changed": recap.changed,
        "failed": recap.failed,
        "total": history.len(),
    })
}

impl Reporter for JsonReporter {
    fn start_tasks(&self) {
        self.emit_json(&json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": "tasks_start",
        }));
    }

    fn start_play(&self, play: &Play) {
        self.emit_json(&json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": "play_start",
            "name": play.name,
            "tasks": play.tasks.len(),
            "handlers": play.handlers.len(),
        }));
    }

    fn start_task(&self, task: &Task, name: &str, args: &str) {
        self.emit_json(&json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": "task_start",
            "task": name,
            "command": task.command,
            "args": args,
        }));
    }

    fn finish_task(&self, result: &RunResult) {
        self.emit_json(&task_event(result));
    }

    fn finish_tasks(&self, history: &[RunResult]) {
        self.emit_json(&recap_event("tasks_complete", history));
    }

    fn start_handlers(&self) {
        self.emit_json(&json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": "handlers_start",
        }));
    }

    fn finish_handlers(&self, history: &[RunResult]) {
        self.emit_json(&recap_event("run_complete", history));
    }
}
