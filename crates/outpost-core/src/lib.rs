//! Outpost core: command dispatch, routing to user-session helpers, and the
//! local IPC broker that connects them.

pub mod agent;
pub mod broker;
pub mod config;
pub mod dispatch;
pub mod executor;
pub mod helper;
pub mod ipc;
pub mod paths;
pub mod router;
pub mod spawner;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use agent::{CommandLoop, CommandOutcome};
pub use broker::{HelperSession, SessionBroker, SessionIdentity, TargetHint};
pub use config::{AgentConfig, DetachedMode, HelperConfig};
pub use dispatch::{DispatchRegistry, HandlerContext, build_registry};
pub use executor::ShellScriptExecutor;
pub use router::{ExecutionRouter, RouterConfig};
pub use spawner::HelperSpawner;
