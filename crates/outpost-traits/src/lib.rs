//! Outpost Traits - command model and collaborator seams.
//!
//! Shared by the agent core and anything that plugs into it:
//! - Command, CommandResult, CommandStatus
//! - CommandHandler and the closure adapter used by the dispatch registry
//! - AgentError, the error kinds every handler maps into a result
//! - SystemTools and ScriptExecutor collaborators

pub mod collaborators;
pub mod command;
pub mod error;
pub mod handler;

pub use collaborators::{
    DEFAULT_SCRIPT_TIMEOUT_SECS, RunningScript, ScriptExecution, ScriptExecutor, ScriptOutput,
    SystemTools,
};
pub use command::{Command, CommandResult, CommandStatus};
pub use error::{AgentError, Result as AgentResult};
pub use handler::{CommandHandler, FnHandler, handler_fn};
