// Named, memoized deferred task execution
//
// A future's producer is spawned the moment the future is created, so
// independent futures make progress while later synchronous tasks run.
// The producer runs exactly once; any number of readers await the same
// memoized result.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::result::{RunResult, TaskOutput};
use crate::output::errors::CommandError;
use crate::parser::ast::{Task, Value, Vars};
use crate::runtime::scope::{NestedScope, Scope};
use crate::runtime::template::referenced_names;

/// Lifecycle of a future
#[derive(Debug, Clone)]
pub enum FutureState {
    Pending,
    Running,
    Resolved(Arc<RunResult>),
}

impl FutureState {
    pub fn is_resolved(&self) -> bool {
        matches!(self, FutureState::Resolved(_))
    }
}

/// A deferred task execution
pub struct TaskFuture {
    task: Arc<Task>,
    state: watch::Receiver<FutureState>,
}

impl TaskFuture {
    /// Start `producer` on its own tokio task and return the handle
    ///
    /// A producer error resolves into a failed result rather than reaching
    /// readers as an error.
    pub fn spawn<F>(start: Instant, task: Arc<Task>, producer: F) -> Self
    where
        F: Future<Output = Result<TaskOutput, CommandError>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(FutureState::Pending);
        let owner = task.clone();

        tokio::spawn(async move {
            tx.send_replace(FutureState::Running);

            let output = match producer.await {
                Ok(output) => output,
                Err(e) => {
                    warn!(task = %owner.name, error = %e, "future producer failed");
                    TaskOutput::failure(e.to_string())
                }
            };

            let result = RunResult::new(owner, output, start.elapsed());
            tx.send_replace(FutureState::Resolved(Arc::new(result)));
        });

        TaskFuture { task, state: rx }
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn state(&self) -> FutureState {
        self.state.borrow().clone()
    }

    /// The memoized result, if already resolved
    pub fn try_result(&self) -> Option<Arc<RunResult>> {
        match &*self.state.borrow() {
            FutureState::Resolved(result) => Some(result.clone()),
            _ => None,
        }
    }

    /// Wait for the producer to finish
    pub async fn resolve(&self) -> Arc<RunResult> {
        let mut rx = self.state.clone();

        if let Ok(state) = rx.wait_for(FutureState::is_resolved).await {
            if let FutureState::Resolved(result) = &*state {
                return result.clone();
            }
        }

        // The producer task went away without resolving (it panicked).
        Arc::new(RunResult::new(
            self.task.clone(),
            TaskOutput::failure("future producer aborted before resolving"),
            Duration::ZERO,
        ))
    }
}

struct FutureEntry {
    name: String,
    future: Arc<TaskFuture>,
    drained: bool,
}

/// A scope that also owns the play's futures
///
/// Reading a future-bound name yields the future's result. Futures take
/// precedence over plain variables of the same name.
pub struct FutureScope {
    scope: NestedScope<'static>,
    futures: Mutex<Vec<FutureEntry>>,
}

impl FutureScope {
    pub fn new(vars: Vars) -> Self {
        FutureScope {
            scope: NestedScope::from_vars(vars),
            futures: Mutex::new(Vec::new()),
        }
    }

    pub fn add_future(&self, name: impl Into<String>, future: TaskFuture) {
        let name = name.into();
        debug!(future = %name, "registered future");
        self.futures.lock().push(FutureEntry {
            name,
            future: Arc::new(future),
            drained: false,
        });
    }

    /// Most recently registered future bound to `name`
    pub fn future(&self, name: &str) -> Option<Arc<TaskFuture>> {
        self.futures
            .lock()
            .iter()
            .rev()
            .find(|e| e.name == name)
            .map(|e| e.future.clone())
    }

    pub fn len(&self) -> usize {
        self.futures.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve the future bound to `name`, if any
    pub async fn force(&self, name: &str) -> Option<Arc<RunResult>> {
        let future = self.future(name)?;
        Some(future.resolve().await)
    }

    /// Resolve every future a template refers to, so that a following
    /// synchronous expansion can read their results
    pub async fn force_referenced(&self, template: &str) {
        for name in referenced_names(template) {
            self.force(&name).await;
        }
    }

    /// Wait until every registered future has resolved
    pub async fn wait(&self) {
        let futures: Vec<Arc<TaskFuture>> =
            self.futures.lock().iter().map(|e| e.future.clone()).collect();

        for future in futures {
            future.resolve().await;
        }
    }

    /// Results of futures resolved since the last call, in registration order
    pub fn results(&self) -> Vec<RunResult> {
        let mut futures = self.futures.lock();
        let mut out = Vec::new();

        for entry in futures.iter_mut().filter(|e| !e.drained) {
            if let Some(result) = entry.future.try_result() {
                entry.drained = true;
                out.push((*result).clone());
            }
        }

        out
    }
}

impl Scope for FutureScope {
    fn get(&self, name: &str) -> Option<Value> {
        if let Some(future) = self.future(name) {
            match future.try_result() {
                Some(result) => return Some(result.output.to_value()),
                None => {
                    debug!(future = %name, "read of unresolved future");
                    return None;
                }
            }
        }

        self.scope.get(name)
    }

    fn set(&self, name: &str, value: Value) {
        self.scope.set(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn task(name: &str) -> Arc<Task> {
        Arc::new(Task::new("shell", "true").named(name))
    }

    #[tokio::test]
    async fn test_producer_runs_once_for_many_readers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let fs = FutureScope::new(Vars::new());
        fs.add_future(
            "slow",
            TaskFuture::spawn(Instant::now(), task("slow"), async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                let mut out = TaskOutput::new(true);
                out.add("stdout", "done");
                Ok(out)
            }),
        );

        let (a, b) = tokio::join!(fs.force("slow"), fs.force("slow"));
        let c = fs.force("slow").await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert!(c.is_some());
        assert_eq!(
            fs.get("slow").and_then(|v| v.lookup(&["stdout"]).cloned()),
            Some(Value::from("done"))
        );
    }

    #[tokio::test]
    async fn test_producer_error_resolves_to_failed_result() {
        let fs = FutureScope::new(Vars::new());
        fs.add_future(
            "broken",
            TaskFuture::spawn(Instant::now(), task("broken"), async {
                Err(CommandError::Failed("exploded".to_string()))
            }),
        );

        let result = fs.force("broken").await.unwrap();
        assert!(result.output.failed());
        assert_eq!(result.output.error(), Some("exploded"));
    }

    #[tokio::test]
    async fn test_wait_and_drain_results() {
        let fs = FutureScope::new(Vars::new());
        for name in ["a", "b"] {
            fs.add_future(
                name,
                TaskFuture::spawn(Instant::now(), task(name), async {
                    Ok(TaskOutput::new(false))
                }),
            );
        }

        fs.wait().await;
        let drained = fs.results();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].task.name, "a");
        assert!(fs.results().is_empty());
        assert!(fs.future("a").unwrap().state().is_resolved());
    }

    #[tokio::test]
    async fn test_plain_vars_and_writes() {
        let mut vars = Vars::new();
        vars.insert("pkg".to_string(), Value::from("nginx"));

        let fs = FutureScope::new(vars);
        fs.set("out", Value::Int(1));

        assert_eq!(fs.get("pkg"), Some(Value::from("nginx")));
        assert_eq!(fs.get("out"), Some(Value::Int(1)));
        assert!(fs.force("pkg").await.is_none());
        assert!(fs.is_empty());
    }
}
