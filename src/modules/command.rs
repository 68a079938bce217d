// Command module - run a process directly from its argument words

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as Process;
use tracing::debug;

use super::{split_words, ArgField, BoundArgs, Builtin, Command};
use crate::executor::result::SUMMARY_KEY;
use crate::executor::{CommandEnv, TaskOutput};
use crate::output::errors::{BindError, CommandError};
use crate::parser::ast::{Value, Vars};
use crate::runtime::Scope;

/// Longest stdout still rendered into the one-line summary
const SUMMARY_MAX_STDOUT: usize = 60;

/// Prefix for echoed output lines
const ECHO_PREFIX: &str = "| ";

/// Captured output of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    /// Process exit code; -1 when terminated by a signal
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.return_code == 0
    }
}

/// Spawn `parts[0]` with the remaining words as arguments and capture its
/// output line by line, echoing it live when the config asks for it
pub async fn run_process(env: &CommandEnv, parts: &[String]) -> Result<CommandResult, CommandError> {
    let (program, rest) = parts.split_first().ok_or(CommandError::EmptyCommand)?;
    let show = env.config().show_command_output;

    if show {
        println!("RUN: {}", parts.join(" "));
    }
    debug!(program = %program, args = ?rest, "spawning process");

    let mut child = Process::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CommandError::path(program, e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CommandError::Failed("failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| CommandError::Failed("failed to capture stderr".to_string()))?;

    let stdout_task = tokio::spawn(capture_lines(stdout, show));
    let stderr_task = tokio::spawn(capture_lines(stderr, show));

    let status = child.wait().await?;

    let stdout = stdout_task
        .await
        .map_err(|e| CommandError::Failed(format!("failed to read stdout: {}", e)))?;
    let stderr = stderr_task
        .await
        .map_err(|e| CommandError::Failed(format!("failed to read stderr: {}", e)))?;

    Ok(CommandResult {
        return_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

async fn capture_lines<R>(stream: R, show: bool) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut captured = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if show {
                    print!("{}{}", ECHO_PREFIX, String::from_utf8_lossy(&line));
                }
                captured.extend_from_slice(&line);
            }
        }
    }

    String::from_utf8_lossy(&captured).into_owned()
}

/// Run a process and shape its output into a task result
pub(crate) async fn run_cmd(env: &CommandEnv, parts: &[String]) -> Result<TaskOutput, CommandError> {
    let cmd = run_process(env, parts).await?;

    let mut output = TaskOutput::new(true);
    output.add("rc", i64::from(cmd.return_code));
    output.add("stdout", cmd.stdout.trim());
    output.add("stderr", cmd.stderr.trim());

    if let Some(summary) = render_shell_result(&output) {
        output.add(SUMMARY_KEY, summary);
    }

    Ok(output)
}

/// Compact one-line summary of a process result
///
/// Empty for a silent success, `rc: N, stdout: "..."` for short single-line
/// stdout with no stderr, and `None` otherwise.
pub fn render_shell_result(output: &TaskOutput) -> Option<String> {
    let rc = output.get("rc").and_then(Value::as_i64)?;
    let stdout = output.get("stdout").and_then(Value::as_str)?;
    let stderr = output.get("stderr").and_then(Value::as_str)?;

    if rc == 0 && stdout.is_empty() && stderr.is_empty() {
        return Some(String::new());
    }

    if stderr.is_empty() && stdout.len() < SUMMARY_MAX_STDOUT && !stdout.contains('\n') {
        return Some(format!(r#"rc: {}, stdout: "{}""#, rc, stdout));
    }

    None
}

/// Shorthand used by the process-style builtins: the whole text is the command
pub(crate) fn command_shorthand(raw: &str) -> Vars {
    let mut vars = Vars::new();
    vars.insert("command".to_string(), Value::from(raw));
    vars
}

pub(crate) const COMMAND_FIELDS: &[ArgField] = &[ArgField::required("command")];

/// Factory for `command`
pub struct CommandBuiltin;

impl Builtin for CommandBuiltin {
    fn name(&self) -> &'static str {
        "command"
    }

    fn fields(&self) -> &'static [ArgField] {
        COMMAND_FIELDS
    }

    fn parse_args(&self, _scope: &dyn Scope, raw: &str) -> Result<Option<Vars>, BindError> {
        Ok(Some(command_shorthand(raw)))
    }

    fn instantiate(&self, args: BoundArgs) -> Result<Arc<dyn Command>, BindError> {
        Ok(Arc::new(CommandCmd {
            command: args.string("command")?,
        }))
    }
}

/// Runs its command line without a shell
pub struct CommandCmd {
    command: String,
}

#[async_trait]
impl Command for CommandCmd {
    async fn run(&self, env: &CommandEnv, _args: &str) -> Result<TaskOutput, CommandError> {
        let parts = split_words(&self.command)?;
        run_cmd(env, &parts).await
    }
}
