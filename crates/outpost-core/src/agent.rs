//! Inbound command loop: one task per command, results sent back in completion order.

use std::sync::Arc;
use std::time::Instant;

use outpost_traits::{AgentError, Command, CommandResult};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::dispatch::DispatchRegistry;

/// A finished command, ready to report to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    pub command_id: String,
    pub result: CommandResult,
}

pub struct CommandLoop {
    registry: Arc<DispatchRegistry>,
}

impl CommandLoop {
    pub fn new(registry: Arc<DispatchRegistry>) -> Self {
        Self { registry }
    }

    /// Run until `commands` closes or `shutdown` fires, then wait for in-flight commands.
    pub async fn run(
        &self,
        mut commands: mpsc::Receiver<Command>,
        results: mpsc::Sender<CommandOutcome>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.spawn_command(&mut tasks, command, results.clone());
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        error!(error = %err, "Command task failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Command loop shutting down");
                    break;
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Command task failed");
            }
        }
    }

    fn spawn_command(
        &self,
        tasks: &mut JoinSet<()>,
        command: Command,
        results: mpsc::Sender<CommandOutcome>,
    ) {
        let registry = self.registry.clone();
        tasks.spawn(async move {
            let command_id = command.id.clone();
            let result = execute_isolated(registry, command).await;
            let outcome = CommandOutcome { command_id, result };
            if results.send(outcome).await.is_err() {
                debug!("Result channel closed, dropping outcome");
            }
        });
    }
}

/// Dispatch on a dedicated task so a panicking handler only fails its own command.
async fn execute_isolated(registry: Arc<DispatchRegistry>, command: Command) -> CommandResult {
    let started = Instant::now();
    let command_type = command.command_type.clone();
    let handle = tokio::spawn(async move { registry.dispatch(&command).await });
    let elapsed = || (started.elapsed().as_millis() as u64).max(1);
    match handle.await {
        Ok((result, true)) => result,
        Ok((_, false)) => CommandResult::from_error(&AgentError::NotFound(command_type), elapsed()),
        Err(err) if err.is_panic() => {
            error!(command_type = %command_type, "Command handler panicked");
            CommandResult::failed("handler panicked", elapsed())
        }
        Err(err) => CommandResult::failed(format!("handler task failed: {err}"), elapsed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_traits::{CommandStatus, handler_fn};
    use serde_json::{Value, json};

    fn registry() -> Arc<DispatchRegistry> {
        let mut registry = DispatchRegistry::new();
        registry.register(
            "echo",
            handler_fn(|cmd: Command| async move {
                CommandResult::success(&Value::Object(cmd.payload), 0)
            }),
        );
        registry.register(
            "explode",
            handler_fn(|cmd: Command| async move {
                if !cmd.id.is_empty() {
                    panic!("handler bug");
                }
                CommandResult::default()
            }),
        );
        Arc::new(registry)
    }

    async fn run_commands(commands: Vec<Command>) -> Vec<CommandOutcome> {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (res_tx, mut res_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let count = commands.len();
        for command in commands {
            cmd_tx.send(command).await.unwrap();
        }
        drop(cmd_tx);

        CommandLoop::new(registry())
            .run(cmd_rx, res_tx, shutdown_rx)
            .await;

        let mut outcomes = Vec::new();
        while let Some(outcome) = res_rx.recv().await {
            outcomes.push(outcome);
        }
        assert_eq!(outcomes.len(), count);
        outcomes.sort_by(|a, b| a.command_id.cmp(&b.command_id));
        outcomes
    }

    #[tokio::test]
    async fn test_unknown_type_reported() {
        let outcomes = run_commands(vec![Command::new("1", "does_not_exist")]).await;
        assert_eq!(outcomes[0].result.status, CommandStatus::Failed);
        assert_eq!(outcomes[0].result.error, "unknown command type: does_not_exist");
        assert!(outcomes[0].result.duration_ms > 0);
    }

    #[tokio::test]
    async fn test_panic_isolated_to_its_command() {
        let outcomes = run_commands(vec![
            Command::new("1", "explode"),
            Command::new("2", "echo").with_payload(json!({"n": 1})),
        ])
        .await;
        assert_eq!(outcomes[0].result.error, "handler panicked");
        assert!(outcomes[0].result.duration_ms > 0);
        assert!(outcomes[1].result.is_success());
        assert_eq!(outcomes[1].result.stdout, r#"{"n":1}"#);
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let (_cmd_tx, cmd_rx) = mpsc::channel::<Command>(1);
        let (res_tx, _res_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let command_loop = CommandLoop::new(registry());
        let run = tokio::spawn(async move { command_loop.run(cmd_rx, res_tx, shutdown_rx).await });
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), run)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_outcome_serializes_camel_case() {
        let outcome = CommandOutcome {
            command_id: "c-1".into(),
            result: CommandResult::failed("x", 2),
        };
        let value = serde_json::to_value(outcome).unwrap();
        assert_eq!(value["commandId"], "c-1");
        assert_eq!(value["result"]["status"], "failed");
    }
}
