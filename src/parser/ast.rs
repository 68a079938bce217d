// Declarative types for converge plays

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Name to value mapping used to seed scopes and carry call arguments
pub type Vars = BTreeMap<String, Value>;

/// A variable value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Walk a dotted path (`out.stdout`, `hosts.0`) into nested maps and lists
    pub fn lookup(&self, path: &[&str]) -> Option<&Value> {
        let mut current = self;
        for part in path {
            current = match current {
                Value::Map(map) => map.get(*part)?,
                Value::List(list) => list.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => f.write_str(s),
            Value::List(_) | Value::Map(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(list: Vec<Value>) -> Self {
        Value::List(list)
    }
}

/// Source of a task's item loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Items {
    /// Items written inline in the play
    List(Vec<Value>),
    /// Name of a variable (or a `{{ name }}` template) holding a list
    Variable(String),
}

/// A single declarative step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Task {
    /// Name template, expanded before reporting
    pub name: String,
    /// Builtin command or play module to invoke
    pub command: String,
    /// Argument template handed to the command
    pub args: String,
    /// Boolean template; a falsy expansion skips the task
    pub when: Option<String>,
    pub items: Option<Items>,
    /// Binds the task's result under this name
    pub register: Option<String>,
    /// Handlers marked due when the task succeeds
    pub notify: Vec<String>,
    /// Fire-and-forget dispatch, awaited at the phase barrier
    pub run_async: bool,
    /// Deferred dispatch, resolved through the play's future scope
    pub future: Option<String>,
    /// Read-only overlay consulted before the play scope
    pub include_vars: Vars,
}

impl Task {
    pub fn new(command: impl Into<String>, args: impl Into<String>) -> Self {
        let command = command.into();
        Task {
            name: command.clone(),
            command,
            args: args.into(),
            ..Default::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_when(mut self, when: impl Into<String>) -> Self {
        self.when = Some(when.into());
        self
    }

    pub fn with_items(mut self, items: Items) -> Self {
        self.items = Some(items);
        self
    }

    pub fn with_register(mut self, name: impl Into<String>) -> Self {
        self.register = Some(name.into());
        self
    }

    pub fn with_notify(mut self, handler: impl Into<String>) -> Self {
        self.notify.push(handler.into());
        self
    }

    pub fn with_async(mut self) -> Self {
        self.run_async = true;
        self
    }

    pub fn with_future(mut self, name: impl Into<String>) -> Self {
        self.future = Some(name.into());
        self
    }

    pub fn with_include_var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.include_vars.insert(name.into(), value.into());
        self
    }
}

/// Named reusable task sequence, invoked like a single task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub name: String,
    pub tasks: Vec<Task>,
}

/// Top-level execution unit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Play {
    pub name: String,
    pub vars: Vars,
    pub tasks: Vec<Task>,
    pub handlers: Vec<Task>,
    pub modules: BTreeMap<String, Module>,
}

impl Play {
    pub fn new(name: impl Into<String>) -> Self {
        Play {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_handler(mut self, handler: Task) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_module(mut self, module: Module) -> Self {
        self.modules.insert(module.name.clone(), module);
        self
    }
}
