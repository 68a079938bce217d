// Fire-and-forget background task tracking
//
// Every async dispatch registers outstanding work before its command is
// spawned. Completions travel over one shared channel to a single listener
// owned by the runner, which is the only background writer of run history.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use super::result::{RunResult, TaskOutput};
use crate::output::errors::CommandError;
use crate::parser::ast::Task;

/// A finished async action, as delivered to the listener
#[derive(Debug)]
pub struct AsyncCompletion {
    pub result: RunResult,
    /// False when the command returned an error
    pub succeeded: bool,
}

/// Counter of async actions that have not yet been fully processed
#[derive(Debug, Default)]
pub struct AsyncTracker {
    outstanding: AtomicUsize,
    idle: Notify,
}

impl AsyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn begin(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark one action as fully processed
    pub fn complete(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Wait until no action is outstanding
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.outstanding() == 0 {
                return;
            }

            notified.await;
        }
    }
}

/// Sending side of the completion channel plus the shared counter
#[derive(Clone)]
pub struct AsyncChannel {
    tracker: Arc<AsyncTracker>,
    sender: mpsc::UnboundedSender<AsyncCompletion>,
}

impl AsyncChannel {
    pub fn new(tracker: Arc<AsyncTracker>) -> (Self, mpsc::UnboundedReceiver<AsyncCompletion>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (AsyncChannel { tracker, sender }, receiver)
    }

    pub fn tracker(&self) -> &Arc<AsyncTracker> {
        &self.tracker
    }
}

/// A background-dispatched task not addressed by name
pub struct AsyncAction {
    task: Arc<Task>,
    start: Instant,
    channel: AsyncChannel,
}

impl AsyncAction {
    /// Register outstanding work and return immediately
    pub fn init(task: Arc<Task>, start: Instant, channel: &AsyncChannel) -> Self {
        channel.tracker.begin();
        debug!(task = %task.name, "async action registered");

        AsyncAction {
            task,
            start,
            channel: channel.clone(),
        }
    }

    /// Run `work` on a spawned task and finish with its outcome
    ///
    /// A panic inside `work` finishes the action as failed, so the barrier
    /// is still released.
    pub fn spawn<F>(self, work: F)
    where
        F: Future<Output = Result<TaskOutput, CommandError>> + Send + 'static,
    {
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(task = %self.task.name, "async command panicked");
                    Err(CommandError::Failed("command panicked".to_string()))
                }
            };
            self.finish(outcome);
        });
    }

    /// Report completion. Consumes the action, so it happens exactly once.
    pub fn finish(self, outcome: Result<TaskOutput, CommandError>) {
        let runtime = self.start.elapsed();
        let (output, succeeded) = match outcome {
            Ok(output) => (output, true),
            Err(e) => (TaskOutput::failure(e.to_string()), false),
        };

        let completion = AsyncCompletion {
            result: RunResult::new(self.task, output, runtime),
            succeeded,
        };

        if self.channel.sender.send(completion).is_err() {
            warn!("async completion dropped: listener is gone");
            self.channel.tracker.complete();
        }
    }
}
