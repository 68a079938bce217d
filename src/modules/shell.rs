// Shell module - execute commands through sh -c
// This allows shell features like variable expansion, pipes, and redirects

use std::sync::Arc;

use async_trait::async_trait;

use super::command::{command_shorthand, run_cmd, COMMAND_FIELDS};
use super::{ArgField, BoundArgs, Builtin, Command};
use crate::executor::{CommandEnv, TaskOutput};
use crate::output::errors::{BindError, CommandError};
use crate::parser::ast::Vars;
use crate::runtime::Scope;

/// Factory for `shell`
pub struct ShellBuiltin;

impl Builtin for ShellBuiltin {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn fields(&self) -> &'static [ArgField] {
        COMMAND_FIELDS
    }

    fn parse_args(&self, _scope: &dyn Scope, raw: &str) -> Result<Option<Vars>, BindError> {
        Ok(Some(command_shorthand(raw)))
    }

    fn instantiate(&self, args: BoundArgs) -> Result<Arc<dyn Command>, BindError> {
        Ok(Arc::new(ShellCmd {
            command: args.string("command")?,
        }))
    }
}

pub struct ShellCmd {
    command: String,
}

#[async_trait]
impl Command for ShellCmd {
    async fn run(&self, env: &CommandEnv, _args: &str) -> Result<TaskOutput, CommandError> {
        let parts = ["sh".to_string(), "-c".to_string(), self.command.clone()];
        run_cmd(env, &parts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Environment;
    use crate::parser::ast::{Task, Value};

    fn env() -> CommandEnv {
        CommandEnv::new(
            Arc::new(Environment::adhoc()),
            Arc::new(Task::new("shell", "")),
        )
    }

    #[tokio::test]
    async fn test_shell_pipes() {
        let cmd = ShellCmd {
            command: "printf 'b\\na\\n' | sort | head -n 1".to_string(),
        };
        let out = cmd.run(&env(), "").await.unwrap();
        assert_eq!(out.get("stdout"), Some(&Value::from("a")));
    }

    #[tokio::test]
    async fn test_shell_silent_success() {
        let cmd = ShellCmd {
            command: "true".to_string(),
        };
        let out = cmd.run(&env(), "").await.unwrap();
        assert_eq!(out.summary(), Some(""));
    }

    #[tokio::test]
    async fn test_shell_keeps_real_exit_code() {
        let cmd = ShellCmd {
            command: "echo oops >&2; exit 3".to_string(),
        };
        let out = cmd.run(&env(), "").await.unwrap();
        assert_eq!(out.get("rc"), Some(&Value::Int(3)));
        assert_eq!(out.get("stderr"), Some(&Value::from("oops")));
        assert!(out.summary().is_none());
        assert!(!out.failed());
    }
}
