// Built-in commands and the command registry

pub mod args;
mod command;
mod copy;
mod script;
mod shell;

pub use args::{parse_simple_map, split_words};
pub use command::{render_shell_result, run_process, CommandBuiltin, CommandResult};
pub use copy::CopyBuiltin;
pub use script::ScriptBuiltin;
pub use shell::ShellBuiltin;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::executor::{CommandEnv, TaskOutput};
use crate::output::errors::{BindError, CommandError, RunError};
use crate::parser::ast::{Task, Value, Vars};
use crate::runtime::Scope;

/// A capability executed by a task
#[async_trait]
pub trait Command: Send + Sync {
    /// Execute against `env` with the already-expanded argument text
    async fn run(&self, env: &CommandEnv, args: &str) -> Result<TaskOutput, CommandError>;
}

/// One declared argument of a builtin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgField {
    pub name: &'static str,
    pub required: bool,
    pub default: Option<&'static str>,
}

impl ArgField {
    pub const fn required(name: &'static str) -> Self {
        ArgField {
            name,
            required: true,
            default: None,
        }
    }

    pub const fn optional(name: &'static str, default: Option<&'static str>) -> Self {
        ArgField {
            name,
            required: false,
            default,
        }
    }
}

/// Arguments that passed schema validation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArgs {
    command: String,
    values: Vars,
}

impl BoundArgs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// String form of `name`, which must be present
    pub fn string(&self, name: &str) -> Result<String, BindError> {
        self.values
            .get(name)
            .map(|v| v.to_string())
            .ok_or_else(|| BindError::MissingArgument {
                command: self.command.clone(),
                argument: name.to_string(),
            })
    }
}

/// Validate `values` against `fields`, filling defaults
pub fn bind_args(command: &str, fields: &[ArgField], mut values: Vars) -> Result<BoundArgs, BindError> {
    if let Some(unknown) = values
        .keys()
        .find(|k| !fields.iter().any(|f| f.name == k.as_str()))
    {
        return Err(BindError::UnknownArgument {
            command: command.to_string(),
            argument: unknown.clone(),
        });
    }

    for field in fields {
        if values.contains_key(field.name) {
            continue;
        }
        if let Some(default) = field.default {
            values.insert(field.name.to_string(), Value::from(default));
        } else if field.required {
            return Err(BindError::MissingArgument {
                command: command.to_string(),
                argument: field.name.to_string(),
            });
        }
    }

    Ok(BoundArgs {
        command: command.to_string(),
        values,
    })
}

/// Factory for a named builtin command
pub trait Builtin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Argument schema used for binding
    fn fields(&self) -> &'static [ArgField];

    /// Shorthand pre-parsing of the raw argument text. `None` falls back to
    /// `key=value` parsing.
    fn parse_args(&self, _scope: &dyn Scope, _raw: &str) -> Result<Option<Vars>, BindError> {
        Ok(None)
    }

    fn instantiate(&self, args: BoundArgs) -> Result<Arc<dyn Command>, BindError>;
}

/// Explicit registry of builtins, built once and shared by the environment
#[derive(Default)]
pub struct CommandRegistry {
    builtins: BTreeMap<String, Arc<dyn Builtin>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `command`, `shell`, `copy` and `script`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CommandBuiltin));
        registry.register(Arc::new(ShellBuiltin));
        registry.register(Arc::new(CopyBuiltin));
        registry.register(Arc::new(ScriptBuiltin));
        registry
    }

    pub fn register(&mut self, builtin: Arc<dyn Builtin>) {
        self.builtins.insert(builtin.name().to_string(), builtin);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Builtin>> {
        self.builtins.get(name).cloned()
    }

    /// Build the command a task selects, binding its expanded arguments
    pub fn make_command(
        &self,
        scope: &dyn Scope,
        task: &Task,
        args: &str,
    ) -> Result<Arc<dyn Command>, RunError> {
        let builtin = self
            .get(&task.command)
            .ok_or_else(|| RunError::UnknownCommand(task.command.clone()))?;

        let bind_err = |source| RunError::Bind {
            task: task.name.clone(),
            source,
        };

        let values = match builtin.parse_args(scope, args).map_err(bind_err)? {
            Some(values) => values,
            None => parse_simple_map(args).map_err(bind_err)?,
        };

        let bound = bind_args(builtin.name(), builtin.fields(), values).map_err(bind_err)?;
        builtin.instantiate(bound).map_err(bind_err)
    }
}
