// Play runner - task phase, barrier, handler phase
//
// A single controlling task walks every play's tasks in declaration order.
// Futures and async actions run on spawned tokio tasks; async completions
// reach run history through one listener. Handlers run once all task work
// has drained, gated by the notify set.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::async_jobs::{AsyncAction, AsyncChannel, AsyncCompletion, AsyncTracker};
use super::context::{CommandEnv, Environment};
use super::future::{FutureScope, TaskFuture};
use super::handlers::NotifySet;
use super::result::{RunResult, TaskOutput};
use crate::modules::{parse_simple_map, Command};
use crate::output::errors::{CommandError, ExpandError, RunError};
use crate::output::Reporter;
use crate::parser::ast::{Items, Module, Play, Task, Value};
use crate::runtime::{boolify, expand, NestedScope, PriorityScope, Scope};

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    RunningTasks,
    /// Waiting for outstanding async actions
    BarrierWait,
    RunningHandlers,
    Done,
}

/// State written by both the controlling task and the async listener
pub(crate) struct RunState {
    history: Mutex<Vec<RunResult>>,
    notify: NotifySet,
    phase: Mutex<RunPhase>,
    reporter: RwLock<Arc<dyn Reporter>>,
}

impl RunState {
    fn new(reporter: Arc<dyn Reporter>) -> Self {
        RunState {
            history: Mutex::new(Vec::new()),
            notify: NotifySet::new(),
            phase: Mutex::new(RunPhase::Idle),
            reporter: RwLock::new(reporter),
        }
    }

    fn reporter(&self) -> Arc<dyn Reporter> {
        self.reporter.read().clone()
    }

    fn set_phase(&self, phase: RunPhase) {
        debug!(?phase, "run phase");
        *self.phase.lock() = phase;
    }

    /// Append a finished execution, report it and apply its notifications
    fn record(&self, result: RunResult, succeeded: bool) {
        self.reporter().finish_task(&result);

        if succeeded {
            self.notify.notify_all(&result.task.notify);
        } else if !result.task.notify.is_empty() {
            debug!(task = %result.task.name, "task failed, handlers not notified");
        }

        self.history.lock().push(result);
    }

    fn snapshot(&self) -> Vec<RunResult> {
        self.history.lock().clone()
    }
}

/// Per-play context threaded through dispatch
struct PlayCtx<'a> {
    play: &'a Play,
    futures: &'a FutureScope,
}

/// How a task was dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Skipped,
    /// Ran to completion on the controlling task
    Completed { succeeded: bool, changed: bool },
    /// Handed to a future or async action
    Deferred,
}

impl Dispatch {
    fn failed(self) -> bool {
        matches!(self, Dispatch::Completed { succeeded: false, .. })
    }

    fn changed(self) -> bool {
        matches!(self, Dispatch::Completed { changed: true, .. })
    }
}

/// A task whose name, arguments and command are ready to execute
struct Prepared {
    task: Arc<Task>,
    args: String,
    command: Arc<dyn Command>,
}

/// Executes plays
pub struct Runner {
    env: Arc<Environment>,
    plays: Vec<Play>,
    state: Arc<RunState>,
    channel: AsyncChannel,
    start: Instant,
}

impl Runner {
    /// Create a runner and start its async completion listener
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(env: Arc<Environment>, plays: Vec<Play>) -> Self {
        let state = Arc::new(RunState::new(env.reporter()));
        let tracker = Arc::new(AsyncTracker::new());
        let (channel, receiver) = AsyncChannel::new(tracker.clone());

        tokio::spawn(listen(state.clone(), tracker, receiver));

        Runner {
            env,
            plays,
            state,
            channel,
            start: Instant::now(),
        }
    }

    pub fn set_reporter(&mut self, reporter: Arc<dyn Reporter>) {
        *self.state.reporter.write() = reporter;
    }

    /// Mark handlers as due
    pub fn add_notify(&self, names: &[String]) {
        self.state.notify.notify_all(names);
    }

    pub fn should_run_handler(&self, name: &str) -> bool {
        self.state.notify.contains(name)
    }

    /// Run history in completion order
    pub fn results(&self) -> Vec<RunResult> {
        self.state.snapshot()
    }

    pub fn phase(&self) -> RunPhase {
        *self.state.phase.lock()
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    /// Time since the run started
    pub fn runtime(&self) -> Duration {
        self.start.elapsed()
    }

    /// Execute every play's tasks, then the notified handlers
    ///
    /// A fatal error stops the run at once; history gathered so far stays
    /// available through `results()`.
    pub async fn run(&mut self) -> Result<(), RunError> {
        self.start = Instant::now();
        let reporter = self.state.reporter();

        self.state.set_phase(RunPhase::RunningTasks);
        reporter.start_tasks();

        for play in &self.plays {
            self.run_play_tasks(play).await?;
        }

        self.state.set_phase(RunPhase::BarrierWait);
        let tracker = self.channel.tracker().clone();
        info!(outstanding = tracker.outstanding(), "waiting for async actions");
        tracker.wait_idle().await;

        reporter.finish_tasks(&self.state.snapshot());

        self.state.set_phase(RunPhase::RunningHandlers);
        reporter.start_handlers();

        for play in &self.plays {
            self.run_play_handlers(play).await?;
        }

        // Handlers may dispatch async actions of their own.
        tracker.wait_idle().await;

        reporter.finish_handlers(&self.state.snapshot());
        self.state.set_phase(RunPhase::Done);

        info!(
            results = self.state.history.lock().len(),
            elapsed_ms = self.runtime().as_millis() as u64,
            "run complete"
        );

        Ok(())
    }

    async fn run_play_tasks(&self, play: &Play) -> Result<(), RunError> {
        info!(play = %play.name, tasks = play.tasks.len(), "starting play");
        self.state.reporter().start_play(play);

        let futures = FutureScope::new(play.vars.clone());
        let ctx = PlayCtx {
            play,
            futures: &futures,
        };

        for task in &play.tasks {
            self.run_task(&ctx, task, &futures).await?;
        }

        self.drain_futures(&futures).await;
        Ok(())
    }

    async fn run_play_handlers(&self, play: &Play) -> Result<(), RunError> {
        let pending = self.state.notify.pending(&play.handlers);
        if pending.is_empty() {
            debug!(play = %play.name, "no handlers notified");
            return Ok(());
        }

        let futures = FutureScope::new(play.vars.clone());
        let ctx = PlayCtx {
            play,
            futures: &futures,
        };

        for handler in pending {
            info!(play = %play.name, handler = %handler.name, "running handler");
            self.run_task(&ctx, handler, &futures).await?;
        }

        self.drain_futures(&futures).await;
        Ok(())
    }

    /// Await a play's futures and fold their results into history
    async fn drain_futures(&self, futures: &FutureScope) {
        if futures.is_empty() {
            return;
        }

        debug!(count = futures.len(), "waiting for futures");
        futures.wait().await;

        for result in futures.results() {
            let succeeded = !result.output.failed();
            self.state.record(result, succeeded);
        }
    }

    fn run_task<'a>(
        &'a self,
        ctx: &'a PlayCtx<'a>,
        task: &'a Task,
        scope: &'a dyn Scope,
    ) -> BoxFuture<'a, Result<Dispatch, RunError>> {
        Box::pin(async move {
            let start = Instant::now();
            let overlay = PriorityScope::new(&task.include_vars, scope);

            if let Some(when) = &task.when {
                let expanded = self.expand_field(ctx, &overlay, task, "when", when).await?;
                if !boolify(&expanded) {
                    debug!(task = %task.name, when = %when, "condition false, skipping");
                    return Ok(Dispatch::Skipped);
                }
            }

            if let Some(items) = &task.items {
                return self.run_items(ctx, task, items, scope).await;
            }

            if let Some(module) = ctx.play.modules.get(&task.command) {
                if task.future.is_some() || task.run_async {
                    warn!(task = %task.name, module = %module.name, "module calls always run inline");
                }
                return self.run_module(ctx, task, module, &overlay, scope).await;
            }

            let prepared = self.prepare(ctx, task, &overlay).await?;

            if let Some(name) = &task.future {
                debug!(task = %prepared.task.name, future = %name, "dispatching future");
                let Prepared { task, args, command } = prepared;
                let cmd_env = CommandEnv::new(self.env.clone(), task.clone());
                let future = TaskFuture::spawn(start, task, async move {
                    command.run(&cmd_env, &args).await
                });
                ctx.futures.add_future(name.clone(), future);
                return Ok(Dispatch::Deferred);
            }

            if task.run_async {
                if let Some(register) = &task.register {
                    warn!(task = %task.name, register = %register, "register is ignored for async tasks");
                }
                debug!(task = %prepared.task.name, "dispatching async action");
                let Prepared { task, args, command } = prepared;
                let cmd_env = CommandEnv::new(self.env.clone(), task.clone());
                let action = AsyncAction::init(task, start, &self.channel);
                action.spawn(async move { command.run(&cmd_env, &args).await });
                return Ok(Dispatch::Deferred);
            }

            Ok(self.execute(prepared, scope, start).await)
        })
    }

    /// One synchronous execution per item, with `item` bound in a child scope
    async fn run_items(
        &self,
        ctx: &PlayCtx<'_>,
        task: &Task,
        items: &Items,
        scope: &dyn Scope,
    ) -> Result<Dispatch, RunError> {
        let values = self
            .item_values(ctx, task, items, &PriorityScope::new(&task.include_vars, scope))
            .await?;

        if task.future.is_some() || task.run_async {
            debug!(task = %task.name, "item loops run synchronously");
        }
        debug!(task = %task.name, count = values.len(), "running item loop");

        let mut succeeded = true;
        let mut changed = false;
        for item in values {
            let start = Instant::now();
            let child = NestedScope::child(scope);
            child.set("item", item);
            let overlay = PriorityScope::new(&task.include_vars, &child);

            let outcome = match ctx.play.modules.get(&task.command) {
                Some(module) => self.run_module(ctx, task, module, &overlay, scope).await?,
                None => {
                    let prepared = self.prepare(ctx, task, &overlay).await?;
                    self.execute(prepared, scope, start).await
                }
            };

            succeeded &= !outcome.failed();
            changed |= outcome.changed();
        }

        Ok(Dispatch::Completed { succeeded, changed })
    }

    async fn item_values(
        &self,
        ctx: &PlayCtx<'_>,
        task: &Task,
        items: &Items,
        scope: &dyn Scope,
    ) -> Result<Vec<Value>, RunError> {
        let text = match items {
            Items::List(values) => return Ok(values.clone()),
            Items::Variable(text) => text,
        };

        let path = text
            .trim()
            .strip_prefix("{{")
            .and_then(|s| s.strip_suffix("}}"))
            .unwrap_or(text.as_str())
            .trim();
        let mut parts = path.split('.');
        let head = parts.next().unwrap_or_default();
        let rest: Vec<&str> = parts.collect();

        ctx.futures.force(head).await;

        let undefined = || RunError::Expand {
            task: task.name.clone(),
            field: "items",
            source: ExpandError::Undefined(path.to_string()),
        };
        let root = scope.get(head).ok_or_else(undefined)?;
        let value = root.lookup(&rest).cloned().ok_or_else(undefined)?;

        match value {
            Value::List(values) => Ok(values),
            other => Err(RunError::MalformedItems {
                task: task.name.clone(),
                message: format!("'{}' holds {}", path, other),
            }),
        }
    }

    /// Run a play module's tasks in a fresh child scope seeded with the
    /// caller's `k=v` arguments
    ///
    /// The call itself is recorded after its sub-tasks: changed if any of
    /// them changed, failed if any of them failed. `register` binds into
    /// `scope`.
    async fn run_module(
        &self,
        ctx: &PlayCtx<'_>,
        task: &Task,
        module: &Module,
        overlay: &dyn Scope,
        scope: &dyn Scope,
    ) -> Result<Dispatch, RunError> {
        let start = Instant::now();
        let name = self.expand_field(ctx, overlay, task, "name", &task.name).await?;
        let args = self.expand_field(ctx, overlay, task, "args", &task.args).await?;
        let values = parse_simple_map(&args).map_err(|source| RunError::Bind {
            task: task.name.clone(),
            source,
        })?;

        info!(task = %name, module = %module.name, "entering module");
        self.state.reporter().start_task(task, &name, &args);

        let child = NestedScope::child(overlay);
        for (key, value) in values {
            child.set(&key, value);
        }

        let mut succeeded = true;
        let mut changed = false;
        for sub in &module.tasks {
            let outcome = self.run_task(ctx, sub, &child).await?;
            succeeded &= !outcome.failed();
            changed |= outcome.changed();
        }

        let mut output = TaskOutput::new(changed);
        if !succeeded {
            output.mark_failed(format!("module '{}' had failing tasks", module.name));
        }

        if let Some(register) = &task.register {
            scope.set(register, output.to_value());
        }

        let task = Arc::new(Task {
            name,
            ..task.clone()
        });
        self.state
            .record(RunResult::new(task, output, start.elapsed()), succeeded);

        Ok(Dispatch::Completed { succeeded, changed })
    }

    /// Expand name and args, build the command and report the start
    async fn prepare(
        &self,
        ctx: &PlayCtx<'_>,
        task: &Task,
        scope: &dyn Scope,
    ) -> Result<Prepared, RunError> {
        let name = self.expand_field(ctx, scope, task, "name", &task.name).await?;
        let args = self.expand_field(ctx, scope, task, "args", &task.args).await?;
        let command = self.env.registry.make_command(scope, task, &args)?;

        debug!(task = %name, command = %task.command, "starting task");
        self.state.reporter().start_task(task, &name, &args);

        let task = Arc::new(Task {
            name,
            ..task.clone()
        });

        Ok(Prepared {
            task,
            args,
            command,
        })
    }

    /// Run on the controlling task, binding `register` into `scope`
    async fn execute(&self, prepared: Prepared, scope: &dyn Scope, start: Instant) -> Dispatch {
        let Prepared {
            task,
            args,
            command,
        } = prepared;
        let cmd_env = CommandEnv::new(self.env.clone(), task.clone());

        let (output, succeeded) = settle(&task, command.run(&cmd_env, &args).await);
        let changed = output.changed();
        let runtime = start.elapsed();

        if let Some(register) = &task.register {
            scope.set(register, output.to_value());
        }

        self.state.record(RunResult::new(task, output, runtime), succeeded);
        Dispatch::Completed { succeeded, changed }
    }

    async fn expand_field(
        &self,
        ctx: &PlayCtx<'_>,
        scope: &dyn Scope,
        task: &Task,
        field: &'static str,
        text: &str,
    ) -> Result<String, RunError> {
        ctx.futures.force_referenced(text).await;
        expand(scope, text).map_err(|source| RunError::Expand {
            task: task.name.clone(),
            field,
            source,
        })
    }
}

/// Fold a command error into a failed result
fn settle(task: &Task, outcome: Result<TaskOutput, CommandError>) -> (TaskOutput, bool) {
    match outcome {
        Ok(output) => (output, true),
        Err(e) => {
            warn!(task = %task.name, error = %e, "task failed");
            (TaskOutput::failure(e.to_string()), false)
        }
    }
}

/// Single consumer of async completions
async fn listen(
    state: Arc<RunState>,
    tracker: Arc<AsyncTracker>,
    mut receiver: mpsc::UnboundedReceiver<AsyncCompletion>,
) {
    while let Some(completion) = receiver.recv().await {
        debug!(task = %completion.result.task.name, "async action finished");
        state.record(completion.result, completion.succeeded);
        tracker.complete();
    }
}

/// Run one builtin outside any play
///
/// There is no play, so arguments expand against an empty scope. Command
/// errors come back as a failed output.
pub async fn run_adhoc_task(command: &str, args: &str) -> Result<TaskOutput, RunError> {
    let env = Arc::new(Environment::adhoc());
    let task = Task::new(command, args);

    let scope = NestedScope::default();
    let args = expand(&scope, args).map_err(|source| RunError::Expand {
        task: task.name.clone(),
        field: "args",
        source,
    })?;
    let cmd = env.registry.make_command(&scope, &task, &args)?;

    let cmd_env = CommandEnv::new(env, Arc::new(task));
    let (output, _) = settle(&cmd_env.task, cmd.run(&cmd_env, &args).await);
    Ok(output)
}

/// Run an already-built command outside any play
pub async fn run_adhoc_command(command: &dyn Command, args: &str) -> TaskOutput {
    let env = Arc::new(Environment::adhoc());
    let cmd_env = CommandEnv::new(env, Arc::new(Task::new("adhoc", args)));
    settle(&cmd_env.task, command.run(&cmd_env, args).await).0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Config;
    use crate::modules::{ArgField, BoundArgs, Builtin, CommandRegistry};
    use crate::output::errors::BindError;
    use crate::parser::ast::Vars;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NOTE_FIELDS: &[ArgField] = &[ArgField::optional("msg", Some(""))];

    /// Records each call; fails or panics when asked to
    struct Note {
        calls: Arc<AtomicUsize>,
        delay: Duration,
        msg: String,
    }

    #[async_trait]
    impl Command for Note {
        async fn run(&self, _env: &CommandEnv, _args: &str) -> Result<TaskOutput, CommandError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.msg == "fail" {
                return Err(CommandError::Failed("note asked to fail".to_string()));
            }
            if self.msg == "panic" {
                panic!("note asked to panic");
            }
            let mut out = TaskOutput::new(true);
            out.add("msg", self.msg.clone());
            Ok(out)
        }
    }

    struct NoteBuiltin {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl Builtin for NoteBuiltin {
        fn name(&self) -> &'static str {
            self.name
        }

        fn fields(&self) -> &'static [ArgField] {
            NOTE_FIELDS
        }

        fn parse_args(&self, _scope: &dyn Scope, raw: &str) -> Result<Option<Vars>, BindError> {
            let mut vars = Vars::new();
            vars.insert("msg".to_string(), Value::from(raw));
            Ok(Some(vars))
        }

        fn instantiate(&self, args: BoundArgs) -> Result<Arc<dyn Command>, BindError> {
            Ok(Arc::new(Note {
                calls: self.calls.clone(),
                delay: self.delay,
                msg: args.string("msg")?,
            }))
        }
    }

    struct Harness {
        env: Arc<Environment>,
        note: Arc<AtomicUsize>,
        slow: Arc<AtomicUsize>,
        handler: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new() -> Self {
            let note = Arc::new(AtomicUsize::new(0));
            let slow = Arc::new(AtomicUsize::new(0));
            let handler = Arc::new(AtomicUsize::new(0));

            let mut registry = CommandRegistry::new();
            for (name, calls, delay) in [
                ("note", &note, 1),
                ("slow", &slow, 30),
                ("restart", &handler, 1),
            ] {
                registry.register(Arc::new(NoteBuiltin {
                    name,
                    calls: calls.clone(),
                    delay: Duration::from_millis(delay),
                }));
            }

            let env = Environment::new(Config::default(), Arc::new(registry));
            Harness {
                env: Arc::new(env),
                note,
                slow,
                handler,
            }
        }

        fn runner(&self, play: Play) -> Runner {
            Runner::new(self.env.clone(), vec![play])
        }
    }

    fn msgs(results: &[RunResult]) -> Vec<String> {
        results
            .iter()
            .map(|r| r.output.get("msg").map(|v| v.to_string()).unwrap_or_default())
            .collect()
    }

    /// Counts finished tasks and snapshots the count when handlers begin
    #[derive(Default)]
    struct CountingReporter {
        finished: AtomicUsize,
        at_handlers: AtomicUsize,
    }

    impl Reporter for CountingReporter {
        fn finish_task(&self, _result: &RunResult) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }

        fn start_handlers(&self) {
            self.at_handlers
                .store(self.finished.load(Ordering::SeqCst), Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_false_condition_skips_task() {
        let h = Harness::new();
        let play = Play::new("p")
            .with_var("enabled", "no")
            .with_task(
                Task::new("note", "x")
                    .with_when("{{ enabled }}")
                    .with_notify("restart"),
            )
            .with_handler(Task::new("restart", "").named("restart"));

        let mut runner = h.runner(play);
        runner.run().await.unwrap();

        assert!(runner.results().is_empty());
        assert!(!runner.should_run_handler("restart"));
        assert_eq!(h.note.load(Ordering::SeqCst), 0);
        assert_eq!(h.handler.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sync_results_in_declaration_order() {
        let h = Harness::new();
        let play = Play::new("p")
            .with_task(Task::new("note", "one").named("first"))
            .with_task(Task::new("slow", "two").named("second"))
            .with_task(Task::new("note", "three").named("third"));

        let mut runner = h.runner(play);
        assert_eq!(runner.phase(), RunPhase::Idle);
        runner.run().await.unwrap();
        assert_eq!(runner.phase(), RunPhase::Done);

        let results = runner.results();
        let names: Vec<&str> = results.iter().map(|r| r.task.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
        assert!(results.iter().all(|r| r.runtime > Duration::ZERO));
    }

    #[tokio::test]
    async fn test_future_runs_once_for_many_readers() {
        let h = Harness::new();
        let play = Play::new("p")
            .with_task(Task::new("slow", "computed").with_future("answer"))
            .with_task(Task::new("note", "{{ answer.msg }}").named("read one"))
            .with_task(Task::new("note", "{{ answer.msg }}").named("read two"));

        let mut runner = h.runner(play);
        runner.run().await.unwrap();

        assert_eq!(h.slow.load(Ordering::SeqCst), 1);
        let results = runner.results();
        assert_eq!(results.len(), 3);
        assert_eq!(msgs(&results[..2]), vec!["computed", "computed"]);
        assert_eq!(results[2].task.name, "slow");
    }

    #[tokio::test]
    async fn test_async_actions_drain_before_handlers() {
        let h = Harness::new();
        let reporter = Arc::new(CountingReporter::default());
        let mut play = Play::new("p").with_handler(Task::new("restart", "").named("restart"));
        for i in 0..3 {
            play = play.with_task(
                Task::new("slow", format!("bg-{}", i))
                    .with_async()
                    .with_notify("restart"),
            );
        }

        let mut runner = h.runner(play);
        runner.set_reporter(reporter.clone());
        runner.run().await.unwrap();

        assert_eq!(reporter.at_handlers.load(Ordering::SeqCst), 3);
        assert_eq!(h.slow.load(Ordering::SeqCst), 3);
        assert_eq!(h.handler.load(Ordering::SeqCst), 1);
        assert_eq!(runner.results().len(), 4);
    }

    #[tokio::test]
    async fn test_handler_runs_once_when_notified() {
        let h = Harness::new();
        let play = Play::new("p")
            .with_task(Task::new("note", "a").with_notify("restart"))
            .with_task(Task::new("note", "b").with_notify("restart"))
            .with_handler(Task::new("restart", "").named("restart"))
            .with_handler(Task::new("restart", "").named("reload"));

        let mut runner = h.runner(play);
        runner.run().await.unwrap();

        assert_eq!(h.handler.load(Ordering::SeqCst), 1);
        assert!(runner.should_run_handler("restart"));
        assert!(!runner.should_run_handler("reload"));
    }

    #[tokio::test]
    async fn test_item_loop_binds_item() {
        let h = Harness::new();
        let play = Play::new("p")
            .with_var(
                "packages",
                Value::List(vec![Value::from("nginx"), Value::from("redis")]),
            )
            .with_task(
                Task::new("note", "{{ item }}")
                    .with_items(Items::List(vec![
                        Value::from("a"),
                        Value::from("b"),
                        Value::from("c"),
                    ])),
            )
            .with_task(
                Task::new("note", "pkg-{{ item }}")
                    .with_items(Items::Variable("{{ packages }}".to_string())),
            );

        let mut runner = h.runner(play);
        runner.run().await.unwrap();

        assert_eq!(h.note.load(Ordering::SeqCst), 5);
        assert_eq!(
            msgs(&runner.results()),
            vec!["a", "b", "c", "pkg-nginx", "pkg-redis"]
        );
    }

    #[tokio::test]
    async fn test_items_must_be_a_list() {
        let h = Harness::new();
        let play = Play::new("p")
            .with_var("single", "nginx")
            .with_task(Task::new("note", "{{ item }}").with_items(Items::Variable("single".to_string())));

        let mut runner = h.runner(play);
        assert!(matches!(
            runner.run().await,
            Err(RunError::MalformedItems { .. })
        ));
    }

    #[tokio::test]
    async fn test_failure_continues_without_notify() {
        let h = Harness::new();
        let play = Play::new("p")
            .with_task(Task::new("note", "fail").with_notify("restart"))
            .with_task(Task::new("note", "after"))
            .with_handler(Task::new("restart", "").named("restart"));

        let mut runner = h.runner(play);
        runner.run().await.unwrap();

        let results = runner.results();
        assert_eq!(results.len(), 2);
        assert!(results[0].output.failed());
        assert_eq!(results[0].output.error(), Some("note asked to fail"));
        assert!(!results[1].output.failed());
        assert_eq!(h.handler.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_undefined_variable_is_fatal() {
        let h = Harness::new();
        let play = Play::new("p")
            .with_task(Task::new("note", "fine"))
            .with_task(Task::new("note", "{{ missing }}").named("broken"))
            .with_task(Task::new("note", "never"));

        let mut runner = h.runner(play);
        match runner.run().await {
            Err(RunError::Expand { task, field, .. }) => {
                assert_eq!(task, "broken");
                assert_eq!(field, "args");
            }
            other => panic!("expected expansion failure, got {:?}", other),
        }

        assert_eq!(msgs(&runner.results()), vec!["fine"]);
        assert_eq!(runner.phase(), RunPhase::RunningTasks);
    }

    #[tokio::test]
    async fn test_unknown_command_is_fatal() {
        let h = Harness::new();
        let play = Play::new("p").with_task(Task::new("nonexistent", ""));

        let mut runner = h.runner(play);
        assert!(matches!(
            runner.run().await,
            Err(RunError::UnknownCommand(name)) if name == "nonexistent"
        ));
    }

    #[tokio::test]
    async fn test_module_binds_args_and_shares_notify() {
        let h = Harness::new();
        let module = Module {
            name: "deploy".to_string(),
            tasks: vec![Task::new("note", "deploying {{ target }}").with_notify("restart")],
        };
        let play = Play::new("p")
            .with_module(module)
            .with_task(Task::new("deploy", "target=web"))
            .with_task(Task::new("note", "{{ target }}").with_when("false"))
            .with_handler(Task::new("restart", "").named("restart"));

        let mut runner = h.runner(play);
        runner.run().await.unwrap();

        assert_eq!(msgs(&runner.results())[0], "deploying web");
        assert_eq!(h.handler.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_include_vars_shadow_and_register_binds() {
        let h = Harness::new();
        let play = Play::new("p")
            .with_var("who", "play")
            .with_task(
                Task::new("note", "hello {{ who }}")
                    .with_include_var("who", "overlay")
                    .with_register("greeting"),
            )
            .with_task(Task::new("note", "{{ greeting.msg }} / {{ who }}"));

        let mut runner = h.runner(play);
        runner.run().await.unwrap();

        assert_eq!(
            msgs(&runner.results()),
            vec!["hello overlay", "hello overlay / play"]
        );
    }

    #[tokio::test]
    async fn test_register_keeps_failed_output() {
        let h = Harness::new();
        let play = Play::new("p")
            .with_task(Task::new("note", "fail").with_register("out"))
            .with_task(Task::new("note", "{{ out.failed }}"));

        let mut runner = h.runner(play);
        runner.run().await.unwrap();

        assert_eq!(msgs(&runner.results())[1], "true");
    }

    #[tokio::test]
    async fn test_adhoc_task() {
        let out = run_adhoc_task("shell", "echo adhoc").await.unwrap();
        assert_eq!(out.get("stdout"), Some(&Value::from("adhoc")));

        assert!(matches!(
            run_adhoc_task("bogus", "").await,
            Err(RunError::UnknownCommand(_))
        ));
    }

    #[tokio::test]
    async fn test_adhoc_command_failure_is_folded() {
        let note = Note {
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            msg: "fail".to_string(),
        };
        let out = run_adhoc_command(&note, "").await;
        assert!(out.failed());
    }

    fn deploy_module(sub: Task) -> Module {
        Module {
            name: "deploy".to_string(),
            tasks: vec![sub],
        }
    }

    #[tokio::test]
    async fn test_registered_module_call_is_recorded() {
        let h = Harness::new();
        let play = Play::new("p")
            .with_module(deploy_module(Task::new("note", "deploying {{ target }}")))
            .with_task(Task::new("deploy", "target=web").with_register("dep"))
            .with_task(Task::new("note", "changed={{ dep.changed }}").named("read"));

        let mut runner = h.runner(play);
        runner.run().await.unwrap();

        let results = runner.results();
        let names: Vec<&str> = results.iter().map(|r| r.task.name.as_str()).collect();
        assert_eq!(names, vec!["note", "deploy", "read"]);
        assert!(results[1].output.changed());
        assert!(!results[1].output.failed());
        assert_eq!(msgs(&results)[2], "changed=true");
    }

    #[tokio::test]
    async fn test_failing_module_call_is_failed_and_not_notified() {
        let h = Harness::new();
        let play = Play::new("p")
            .with_module(deploy_module(Task::new("note", "fail")))
            .with_task(Task::new("deploy", "").with_notify("restart"))
            .with_handler(Task::new("restart", "").named("restart"));

        let mut runner = h.runner(play);
        runner.run().await.unwrap();

        let results = runner.results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].task.name, "deploy");
        assert!(results[1].output.failed());
        assert!(!runner.should_run_handler("restart"));
        assert_eq!(h.handler.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_module_call_with_future_runs_inline() {
        let h = Harness::new();
        let play = Play::new("p")
            .with_module(deploy_module(Task::new("slow", "inside")))
            .with_task(Task::new("deploy", "").with_future("later"))
            .with_task(Task::new("note", "after").named("after"));

        let mut runner = h.runner(play);
        runner.run().await.unwrap();

        let results = runner.results();
        let names: Vec<&str> = results.iter().map(|r| r.task.name.as_str()).collect();
        assert_eq!(names, vec!["slow", "deploy", "after"]);
    }

    #[tokio::test]
    async fn test_async_panic_releases_barrier() {
        let h = Harness::new();
        let play = Play::new("p")
            .with_task(Task::new("note", "panic").with_async().with_notify("restart"))
            .with_handler(Task::new("restart", "").named("restart"));

        let mut runner = h.runner(play);
        tokio::time::timeout(Duration::from_secs(5), runner.run())
            .await
            .expect("run finished")
            .unwrap();

        let results = runner.results();
        assert_eq!(results.len(), 1);
        assert!(results[0].output.failed());
        assert_eq!(h.handler.load(Ordering::SeqCst), 0);
        assert_eq!(runner.phase(), RunPhase::Done);
    }

    #[tokio::test]
    async fn test_async_register_is_not_bound() {
        let h = Harness::new();
        let play = Play::new("p")
            .with_task(Task::new("note", "bg").with_async().with_register("bg"))
            .with_task(Task::new("note", "{{ bg.msg }}").named("read"));

        let mut runner = h.runner(play);
        assert!(matches!(
            runner.run().await,
            Err(RunError::Expand { task, .. }) if task == "read"
        ));
    }
}
