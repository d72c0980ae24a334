use std::io::BufRead;
use std::sync::Arc;

use anyhow::Result;
use outpost_core::broker::{BrokerListener, SessionBroker, SessionIdentity};
use outpost_core::config::{AgentConfig, DetachedMode};
use outpost_core::dispatch::{HandlerContext, build_registry};
use outpost_core::ipc::{Envelope, MessageType, TrayAction, current_binary_hash};
use outpost_core::{
    CommandLoop, CommandOutcome, ExecutionRouter, HelperSpawner, ShellScriptExecutor,
};
use outpost_traits::{Command, CommandResult};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cli::ServiceArgs;
use crate::tools::BasicSystemTools;

const QUEUE_DEPTH: usize = 64;

pub async fn run(mut config: AgentConfig, args: ServiceArgs) -> Result<()> {
    if let Some(socket) = args.socket {
        config.socket_path = Some(socket);
    }
    if args.detached {
        config.detached = DetachedMode::Always;
    } else if args.attended {
        config.detached = DetachedMode::Never;
    }

    let (shutdown_tx, _) = broadcast::channel(4);
    let mut stop = shutdown_tx.subscribe();
    super::spawn_shutdown_signal(shutdown_tx.clone());

    let (router, listener) = start_routing(&config, &shutdown_tx);
    info!(
        detached = router.config().detached,
        helper = router.broker().is_some(),
        "Agent service started"
    );

    let registry = Arc::new(build_registry(HandlerContext {
        router,
        tools: Arc::new(BasicSystemTools),
        executor: Arc::new(ShellScriptExecutor::new()),
    }));

    let (command_tx, command_rx) = mpsc::channel(QUEUE_DEPTH);
    let (result_tx, result_rx) = mpsc::channel(QUEUE_DEPTH);

    // Blocking stdin reads cannot be cancelled, so they stay off the runtime.
    let parse_errors = result_tx.clone();
    std::thread::spawn(move || read_commands(std::io::stdin().lock(), command_tx, parse_errors));
    let writer = tokio::spawn(write_outcomes(
        tokio::io::stdout(),
        result_rx,
        shutdown_tx.subscribe(),
    ));

    CommandLoop::new(registry)
        .run(command_rx, result_tx, shutdown_tx.subscribe())
        .await;

    if !args.once {
        info!("Command input closed, serving helpers until shutdown");
        let _ = stop.recv().await;
    }
    let _ = shutdown_tx.send(());

    match writer.await {
        Ok(Err(err)) => warn!(error = %err, "Writing outcomes failed"),
        Err(err) => error!(error = %err, "Outcome writer panicked"),
        Ok(Ok(_)) => {}
    }
    if let Some(listener) = listener {
        let _ = listener.await;
    }
    info!("Agent service stopped");
    Ok(())
}

/// Router plus the broker listener task, or a local-only router when helpers are disabled.
fn start_routing(
    config: &AgentConfig,
    shutdown: &broadcast::Sender<()>,
) -> (Arc<ExecutionRouter>, Option<JoinHandle<()>>) {
    let router_config = config.router_config();
    if !config.helper.enabled {
        info!("User helper disabled, executing everything locally");
        return (Arc::new(ExecutionRouter::new(router_config, None, None)), None);
    }

    let broker = Arc::new(SessionBroker::new());
    broker.set_message_handler(Arc::new(|identity: &SessionIdentity, env: Envelope| {
        if env.kind == MessageType::TrayAction {
            match env.decode::<TrayAction>() {
                Ok(action) => info!(identity = %identity, item = %action.menu_item_id, "Tray action"),
                Err(err) => warn!(identity = %identity, error = %err, "Invalid tray action"),
            }
        } else {
            debug!(identity = %identity, kind = %env.kind, "Ignoring helper message");
        }
    }));

    let expected_hash = if config.verify_helper_binary {
        current_binary_hash()
            .inspect_err(|err| warn!(error = %err, "Helper binary verification disabled"))
            .ok()
    } else {
        None
    };
    let listener = Arc::new(BrokerListener::new(
        config.listener_config(expected_hash),
        broker.clone(),
    ));
    let shutdown_rx = shutdown.subscribe();
    let listener_task = tokio::spawn(async move {
        if let Err(err) = listener.run(shutdown_rx).await {
            error!(error = %err, "Session broker stopped");
        }
    });

    let spawner = match HelperSpawner::for_platform(config.socket_path()) {
        Ok(spawner) => Some(Arc::new(spawner)),
        Err(err) => {
            warn!(error = %err, "Helper spawning unavailable");
            None
        }
    };

    (
        Arc::new(ExecutionRouter::new(router_config, Some(broker), spawner)),
        Some(listener_task),
    )
}

/// Parse newline-delimited JSON commands until EOF. Malformed lines are
/// answered with a failed outcome instead of being dispatched.
fn read_commands<R: BufRead>(
    input: R,
    commands: mpsc::Sender<Command>,
    results: mpsc::Sender<CommandOutcome>,
) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "Reading commands failed");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<Command>(line) {
            Ok(command) => {
                debug!(command_id = %command.id, command_type = %command.command_type, "Command received");
                if commands.blocking_send(command).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(error = %err, "Malformed command");
                let outcome = CommandOutcome {
                    command_id: String::new(),
                    result: CommandResult::failed(format!("invalid command: {err}"), 0),
                };
                if results.blocking_send(outcome).is_err() {
                    break;
                }
            }
        }
    }
    debug!("Command input reached EOF");
}

/// Write each outcome as one JSON line. On shutdown, flush what is queued and return.
async fn write_outcomes<W: AsyncWrite + Unpin>(
    mut out: W,
    mut outcomes: mpsc::Receiver<CommandOutcome>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<W> {
    loop {
        tokio::select! {
            biased;
            outcome = outcomes.recv() => match outcome {
                Some(outcome) => write_line(&mut out, &outcome).await?,
                None => break,
            },
            _ = shutdown.recv() => {
                while let Ok(outcome) = outcomes.try_recv() {
                    write_line(&mut out, &outcome).await?;
                }
                break;
            }
        }
    }
    out.flush().await?;
    Ok(out)
}

async fn write_line<W: AsyncWrite + Unpin>(out: &mut W, outcome: &CommandOutcome) -> Result<()> {
    let mut line = serde_json::to_vec(outcome)?;
    line.push(b'\n');
    out.write_all(&line).await?;
    out.flush().await?;
    Ok(())
}
