// Task outcomes and run history records

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::parser::ast::{Task, Value, Vars};

/// Keys owned by the scheduler; commands cannot set them
const RESERVED_KEYS: [&str; 2] = ["failed", "error"];

/// Key holding the human-readable one-line summary
pub const SUMMARY_KEY: &str = "_result";

/// Outcome of one execution
///
/// An append-only key/value record. `changed` is declared by the command at
/// creation; `failed` and `error` are only ever set by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskOutput {
    changed: bool,
    data: Vec<(String, Value)>,
}

impl TaskOutput {
    pub fn new(changed: bool) -> Self {
        TaskOutput {
            changed,
            data: Vec::new(),
        }
    }

    /// Build an output pre-seeded with `data`
    pub fn wrap(changed: bool, data: Vars) -> Self {
        let mut output = Self::new(changed);
        for (k, v) in data {
            output.add(k, v);
        }
        output
    }

    /// Scheduler-synthesized failure for a command that returned an error
    pub(crate) fn failure(message: impl Into<String>) -> Self {
        let mut output = Self::new(false);
        output.mark_failed(message);
        output
    }

    /// Scheduler-side failure marking; keeps `changed` and existing keys
    pub(crate) fn mark_failed(&mut self, message: impl Into<String>) {
        self.push("failed", Value::Bool(true));
        self.push("error", Value::String(message.into()));
    }

    /// Append `key`. Later additions of the same key win on `get`.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        if RESERVED_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "ignoring scheduler-owned result key set by command");
            return;
        }
        self.push(key, value.into());
    }

    fn push(&mut self, key: impl Into<String>, value: Value) {
        self.data.push((key.into(), value));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn failed(&self) -> bool {
        self.get("failed").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn error(&self) -> Option<&str> {
        self.get("error").and_then(Value::as_str)
    }

    pub fn summary(&self) -> Option<&str> {
        self.get(SUMMARY_KEY).and_then(Value::as_str)
    }

    /// Entries in insertion order, duplicates included
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Convert to a Value for use in templates
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        for (k, v) in &self.data {
            map.insert(k.clone(), v.clone());
        }
        map.insert("changed".to_string(), Value::Bool(self.changed));
        map.insert("failed".to_string(), Value::Bool(self.failed()));
        Value::Map(map)
    }
}

/// One entry of the run history
#[derive(Debug, Clone)]
pub struct RunResult {
    pub task: Arc<Task>,
    pub output: TaskOutput,
    pub runtime: Duration,
}

impl RunResult {
    pub fn new(task: Arc<Task>, output: TaskOutput, runtime: Duration) -> Self {
        RunResult {
            task,
            output,
            runtime,
        }
    }
}
