// Executor module - task execution engine

pub mod async_jobs;
pub mod context;
pub mod future;
pub mod handlers;
pub mod result;
pub mod scheduler;

pub use async_jobs::{AsyncAction, AsyncChannel, AsyncCompletion, AsyncTracker};
pub use context::{CommandEnv, Config, Environment, SearchPaths};
pub use future::{FutureScope, FutureState, TaskFuture};
pub use handlers::NotifySet;
pub use result::{RunResult, TaskOutput, SUMMARY_KEY};
pub use scheduler::{run_adhoc_command, run_adhoc_task, RunPhase, Runner};
