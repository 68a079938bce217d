// converge - execution core for declarative plays
//
// Plays are ordered task lists run against the local machine, with
// conditionals, item loops, named futures, fire-and-forget async actions
// and handlers triggered by successful notifications.

pub mod executor;
pub mod modules;
pub mod output;
pub mod parser;
pub mod runtime;

pub use executor::{Environment, RunPhase, RunResult, Runner, TaskOutput};
pub use output::{CommandError, RunError};
pub use parser::{parse_plays, parse_plays_file, Play, Task};

/// Version of the converge tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::executor::{Config, Environment, Runner, TaskOutput};
    pub use crate::modules::{Builtin, Command, CommandRegistry};
    pub use crate::output::{Reporter, RunError};
    pub use crate::parser::{parse_plays, Play, Task, Value};
    pub use crate::runtime::Scope;
}
