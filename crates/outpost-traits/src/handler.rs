//! Handler seam between the dispatch registry and command implementations.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::command::{Command, CommandResult};

/// Executes one command type. Failures are reported through the result, never by panicking.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &Command) -> CommandResult;
}

/// Adapter turning an async closure into a [`CommandHandler`].
pub struct FnHandler<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Command) -> Fut + Send + Sync,
    Fut: Future<Output = CommandResult> + Send,
{
    async fn handle(&self, command: &Command) -> CommandResult {
        (self.func)(command.clone()).await
    }
}

pub fn handler_fn<F, Fut>(func: F) -> Arc<dyn CommandHandler>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CommandResult> + Send + 'static,
{
    Arc::new(FnHandler { func })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handler_fn_receives_command() {
        let handler = handler_fn(|cmd: Command| async move {
            CommandResult::success(&cmd.command_type, 1)
        });
        let result = handler.handle(&Command::new("1", "ping_test")).await;
        assert_eq!(result.stdout, "\"ping_test\"");
    }
}
