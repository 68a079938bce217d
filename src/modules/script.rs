// Script module - run a script found on the configured search path

use std::sync::Arc;

use async_trait::async_trait;

use super::command::{command_shorthand, run_cmd, COMMAND_FIELDS};
use super::{split_words, ArgField, BoundArgs, Builtin, Command};
use crate::executor::{CommandEnv, TaskOutput};
use crate::output::errors::{BindError, CommandError};
use crate::parser::ast::Vars;
use crate::runtime::Scope;

/// Factory for `script`
pub struct ScriptBuiltin;

impl Builtin for ScriptBuiltin {
    fn name(&self) -> &'static str {
        "script"
    }

    fn fields(&self) -> &'static [ArgField] {
        COMMAND_FIELDS
    }

    fn parse_args(&self, _scope: &dyn Scope, raw: &str) -> Result<Option<Vars>, BindError> {
        Ok(Some(command_shorthand(raw)))
    }

    fn instantiate(&self, args: BoundArgs) -> Result<Arc<dyn Command>, BindError> {
        Ok(Arc::new(ScriptCmd {
            command: args.string("command")?,
        }))
    }
}

pub struct ScriptCmd {
    command: String,
}

#[async_trait]
impl Command for ScriptCmd {
    async fn run(&self, env: &CommandEnv, _args: &str) -> Result<TaskOutput, CommandError> {
        let words = split_words(&self.command)?;
        let (name, rest) = words.split_first().ok_or(CommandError::EmptyCommand)?;

        let path = env.paths().file(name);
        tokio::fs::metadata(&path)
            .await
            .map_err(|e| CommandError::path(&path, e))?;

        let mut parts = Vec::with_capacity(rest.len() + 2);
        parts.push("sh".to_string());
        parts.push(path.display().to_string());
        parts.extend(rest.iter().cloned());

        run_cmd(env, &parts).await
    }
}
