// Execution environment shared by the runner and commands

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::modules::CommandRegistry;
use crate::output::errors::LoadError;
use crate::output::{NullReporter, Reporter};
use crate::parser::ast::Task;

/// Runtime configuration
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Echo each process invocation and its output lines
    pub show_command_output: bool,
    /// Directories searched by the `script` command, in order
    pub script_paths: Vec<PathBuf>,
}

impl Config {
    pub fn from_yaml(content: &str) -> Result<Self, LoadError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }
}

/// Ordered directory list used to resolve relative file names
#[derive(Debug, Clone, Default)]
pub struct SearchPaths {
    dirs: Vec<PathBuf>,
}

impl SearchPaths {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        SearchPaths { dirs }
    }

    /// Resolve `name` to the first existing candidate, or `name` itself
    pub fn file(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            return path.to_path_buf();
        }

        self.dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.exists())
            .unwrap_or_else(|| path.to_path_buf())
    }
}

/// Everything a run needs besides the plays themselves
pub struct Environment {
    pub config: Config,
    pub paths: SearchPaths,
    pub registry: Arc<CommandRegistry>,
    reporter: Arc<dyn Reporter>,
}

impl Environment {
    pub fn new(config: Config, registry: Arc<CommandRegistry>) -> Self {
        let paths = SearchPaths::new(config.script_paths.clone());
        Environment {
            config,
            paths,
            registry,
            reporter: Arc::new(NullReporter),
        }
    }

    /// Minimal environment with default config and the builtin commands
    pub fn adhoc() -> Self {
        Self::new(Config::default(), Arc::new(CommandRegistry::with_builtins()))
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn reporter(&self) -> Arc<dyn Reporter> {
        self.reporter.clone()
    }
}

/// Context handed to a command for one execution
#[derive(Clone)]
pub struct CommandEnv {
    pub env: Arc<Environment>,
    pub task: Arc<Task>,
}

impl CommandEnv {
    pub fn new(env: Arc<Environment>, task: Arc<Task>) -> Self {
        CommandEnv { env, task }
    }

    pub fn config(&self) -> &Config {
        &self.env.config
    }

    pub fn paths(&self) -> &SearchPaths {
        &self.env.paths
    }
}
