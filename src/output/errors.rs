// Error types for converge
//
// Two classes of failure exist. `RunError` aborts the whole run; everything
// a command reports through `CommandError` becomes a failed result and the
// run continues.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Template expansion failures
#[derive(Debug, Error)]
pub enum ExpandError {
    #[error("undefined variable '{0}'")]
    Undefined(String),

    #[error("unterminated expression in '{0}'")]
    Unterminated(String),
}

/// Argument binding failures for builtin commands
#[derive(Debug, Error)]
pub enum BindError {
    #[error("missing required argument '{argument}' for '{command}'")]
    MissingArgument { command: String, argument: String },

    #[error("unknown argument '{argument}' for '{command}'")]
    UnknownArgument { command: String, argument: String },

    #[error("malformed arguments: {0}")]
    Malformed(String),
}

/// Errors returned by a command's `run`
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{path}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("empty command line")]
    EmptyCommand,

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("{0}")]
    Failed(String),
}

impl CommandError {
    pub fn path(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CommandError::Path {
            path: path.into(),
            source,
        }
    }
}

/// Scheduler-fatal errors; any of these aborts the run
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to expand {field} of task '{task}': {source}")]
    Expand {
        task: String,
        field: &'static str,
        #[source]
        source: ExpandError,
    },

    #[error("unknown command or module '{0}'")]
    UnknownCommand(String),

    #[error("task '{task}': {source}")]
    Bind {
        task: String,
        #[source]
        source: BindError,
    },

    #[error("items of task '{task}' must be a list: {message}")]
    MalformedItems { task: String, message: String },
}

/// Play and configuration loading failures
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Invalid(String),
}
