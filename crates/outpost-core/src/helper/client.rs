use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use outpost_traits::{Command, CommandStatus, ScriptExecution, ScriptExecutor};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, broadcast};
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use super::actions::{HelperActions, detect_display_env};
use crate::ipc::{
    AuthRequest, AuthResponse, DesktopStartRequest, DesktopStopRequest, Envelope, EnvelopeReader,
    EnvelopeWriter, IpcCommand, IpcCommandResult, MessageType, NotifyRequest, PROTOCOL_VERSION,
    TrayUpdate, current_binary_hash, framed,
};

const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(60);

type SharedWriter<W> = Arc<Mutex<EnvelopeWriter<W>>>;

/// The user-session side of the broker connection.
pub struct HelperClient {
    socket_path: PathBuf,
    actions: Arc<dyn HelperActions>,
    executor: Arc<dyn ScriptExecutor>,
    keepalive: Duration,
}

impl HelperClient {
    pub fn new(
        socket_path: PathBuf,
        actions: Arc<dyn HelperActions>,
        executor: Arc<dyn ScriptExecutor>,
    ) -> Self {
        Self {
            socket_path,
            actions,
            executor,
            keepalive: DEFAULT_KEEPALIVE,
        }
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive.max(Duration::from_secs(1));
        self
    }

    /// Connect to the broker socket and serve until disconnected or shut down.
    #[cfg(unix)]
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let stream = tokio::net::UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("connect to {}", self.socket_path.display()))?;
        let (reader, writer) = stream.into_split();
        self.serve(reader, writer, auth_request()?, shutdown).await
    }

    #[cfg(not(unix))]
    pub async fn run(&self, _shutdown: broadcast::Receiver<()>) -> Result<()> {
        bail!("user helper not supported on this platform")
    }

    /// Authenticate over an established stream, then handle service requests.
    pub async fn serve<R, W>(
        &self,
        reader: R,
        writer: W,
        request: AuthRequest,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer, key) = framed(reader, writer);

        writer
            .send(Envelope::new("auth", MessageType::AuthRequest, &request)?)
            .await
            .context("send auth request")?;
        let reply = reader.recv().await.context("receive auth response")?;
        if reply.kind != MessageType::AuthResponse {
            bail!("expected auth_response, got {}", reply.kind);
        }
        let response: AuthResponse = reply.decode()?;
        if !response.accepted {
            bail!("auth rejected: {}", response.reason);
        }
        key.set_hex(&response.session_key)
            .context("install session key")?;
        info!(
            uid = request.uid,
            scopes = ?response.allowed_scopes,
            "Connected to agent service"
        );

        let capabilities = self.actions.capabilities();
        writer
            .send(Envelope::new("caps", MessageType::Capabilities, &capabilities)?)
            .await?;

        let writer: SharedWriter<W> = Arc::new(Mutex::new(writer));
        let result = self.message_loop(&mut reader, &writer, &mut shutdown).await;

        let mut writer = writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            debug!(error = %err, "Writer shutdown failed");
        }
        result
    }

    async fn message_loop<R, W>(
        &self,
        reader: &mut EnvelopeReader<R>,
        writer: &SharedWriter<W>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let start = tokio::time::Instant::now() + self.keepalive;
        let mut keepalive = interval_at(start, self.keepalive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping_seq = 0u64;

        loop {
            tokio::select! {
                received = reader.recv() => {
                    let env = received.map_err(|err| anyhow!("connection lost: {err}"))?;
                    if env.kind == MessageType::Disconnect {
                        info!("Service requested disconnect");
                        return Ok(());
                    }
                    self.handle(env, writer);
                }
                _ = keepalive.tick() => {
                    ping_seq += 1;
                    send(writer, Envelope::empty(format!("ping-{ping_seq}"), MessageType::Ping))
                        .await
                        .context("keepalive ping failed")?;
                }
                _ = shutdown.recv() => {
                    info!("Helper shutting down");
                    if let Err(err) = send(writer, Envelope::empty("disconnect", MessageType::Disconnect)).await {
                        debug!(error = %err, "Disconnect notice failed");
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Dispatch one service message. Requests run on their own task.
    fn handle<W>(&self, env: Envelope, writer: &SharedWriter<W>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let actions = self.actions.clone();
        let executor = self.executor.clone();
        let writer = writer.clone();

        match env.kind {
            MessageType::Ping => {
                tokio::spawn(async move {
                    let _ = send(&writer, Envelope::empty(env.id, MessageType::Pong)).await;
                });
            }
            MessageType::Pong => {}
            MessageType::Command => {
                tokio::spawn(async move {
                    let result = run_command(&env, actions.as_ref(), executor).await;
                    reply(&writer, &env.id, MessageType::CommandResult, &result).await;
                });
            }
            MessageType::Notify => {
                tokio::spawn(async move {
                    match env.decode::<NotifyRequest>() {
                        Ok(request) => {
                            let result = actions.notify(&request).await;
                            reply(&writer, &env.id, MessageType::NotifyResult, &result).await;
                        }
                        Err(err) => {
                            reply_error(&writer, &env.id, MessageType::NotifyResult, format!("invalid payload: {err}")).await;
                        }
                    }
                });
            }
            MessageType::TrayUpdate => match env.decode::<TrayUpdate>() {
                Ok(update) => actions.update_tray(&update),
                Err(err) => warn!(error = %err, "Invalid tray update"),
            },
            MessageType::DesktopStart => {
                tokio::spawn(async move {
                    let outcome = match env.decode::<DesktopStartRequest>() {
                        Ok(request) => actions.start_desktop(&request).await,
                        Err(err) => Err(anyhow!("invalid payload: {err}")),
                    };
                    match outcome {
                        Ok(response) => reply(&writer, &env.id, MessageType::DesktopStart, &response).await,
                        Err(err) => reply_error(&writer, &env.id, MessageType::DesktopStart, format!("{err:#}")).await,
                    }
                });
            }
            MessageType::DesktopStop => {
                tokio::spawn(async move {
                    let request: DesktopStopRequest = env.decode().unwrap_or_default();
                    actions.stop_desktop(&request.session_id).await;
                    reply(&writer, &env.id, MessageType::DesktopStop, &json!({"stopped": true})).await;
                });
            }
            other => debug!(kind = %other, "Ignoring message"),
        }
    }
}

async fn send<W>(writer: &SharedWriter<W>, env: Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.lock().await.send(env).await?;
    Ok(())
}

async fn reply<W, T>(writer: &SharedWriter<W>, id: &str, kind: MessageType, payload: &T)
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let sent = match Envelope::new(id, kind, payload) {
        Ok(env) => send(writer, env).await,
        Err(err) => send(writer, Envelope::empty(id, kind).with_error(format!("encode reply: {err}"))).await,
    };
    if let Err(err) = sent {
        warn!(id, kind = %kind, error = %err, "Reply failed");
    }
}

async fn reply_error<W>(writer: &SharedWriter<W>, id: &str, kind: MessageType, error: String)
where
    W: AsyncWrite + Unpin,
{
    if let Err(err) = send(writer, Envelope::empty(id, kind).with_error(error)).await {
        warn!(id, kind = %kind, error = %err, "Reply failed");
    }
}

/// Execute a forwarded command: desktop tools through the actions, everything else as a script.
async fn run_command(
    env: &Envelope,
    actions: &dyn HelperActions,
    executor: Arc<dyn ScriptExecutor>,
) -> IpcCommandResult {
    let request: IpcCommand = match env.decode() {
        Ok(request) => request,
        Err(err) => {
            return IpcCommandResult {
                command_id: env.id.clone(),
                status: CommandStatus::Failed.to_string(),
                error: format!("invalid command payload: {err}"),
                ..Default::default()
            };
        }
    };

    let command = Command::new(&request.command_id, &request.command_type)
        .with_payload(request.payload);

    match command.command_type.as_str() {
        "take_screenshot" | "computer_action" => {
            let result = actions.run_tool(&command).await;
            IpcCommandResult {
                command_id: request.command_id,
                status: result.status.to_string(),
                error: result.error.clone(),
                result: serde_json::to_value(&result).unwrap_or(Value::Null),
            }
        }
        _ => run_script(command, executor).await,
    }
}

async fn run_script(command: Command, executor: Arc<dyn ScriptExecutor>) -> IpcCommandResult {
    // Already running as the target user.
    let script = ScriptExecution {
        run_as: None,
        ..ScriptExecution::from_command(&command)
    };
    match executor.execute(script).await {
        Ok(output) => {
            let status = if output.timed_out {
                CommandStatus::Timeout
            } else if output.exit_code != 0 {
                CommandStatus::Failed
            } else {
                CommandStatus::Completed
            };
            IpcCommandResult {
                command_id: command.id,
                status: status.to_string(),
                result: json!({
                    "exitCode": output.exit_code,
                    "stdout": output.stdout,
                    "stderr": output.stderr,
                }),
                error: output.error.unwrap_or_default(),
            }
        }
        Err(err) => IpcCommandResult {
            command_id: command.id,
            status: CommandStatus::Failed.to_string(),
            error: err.to_string(),
            ..Default::default()
        },
    }
}

/// Describe the current process for the service's handshake checks.
#[cfg(unix)]
pub fn auth_request() -> Result<AuthRequest> {
    let uid = nix::unistd::getuid();
    let username = nix::unistd::User::from_uid(uid)
        .context("look up current user")?
        .map(|user| user.name)
        .unwrap_or_else(|| uid.to_string());
    let binary_hash = current_binary_hash().unwrap_or_else(|err| {
        warn!(error = %err, "Could not hash own executable");
        String::new()
    });

    Ok(AuthRequest {
        protocol_version: PROTOCOL_VERSION,
        uid: uid.as_raw(),
        sid: String::new(),
        username,
        session_id: std::env::var("XDG_SESSION_ID").unwrap_or_default(),
        display_env: detect_display_env(),
        pid: std::process::id(),
        binary_hash,
    })
}
