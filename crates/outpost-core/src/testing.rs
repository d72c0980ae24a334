//! Test doubles: in-memory helper connections, OS tools, scripts, and session launchers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use outpost_traits::{
    AgentResult, Command, CommandResult, RunningScript, ScriptExecution, ScriptExecutor,
    ScriptOutput, SystemTools,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};
use tokio::task::JoinHandle;

use crate::broker::{HelperSession, SessionBroker, SessionIdentity, SessionParams};
use crate::ipc::{Envelope, EnvelopeReader, EnvelopeWriter, MessageType, framed};
use crate::spawner::{DetectedSession, HelperLauncher, SessionDetector};

/// Helper side of a duplex connection whose service side is registered with a broker.
pub struct FakeHelper {
    pub session: Arc<HelperSession>,
    reader: EnvelopeReader<ReadHalf<DuplexStream>>,
    writer: EnvelopeWriter<WriteHalf<DuplexStream>>,
}

impl FakeHelper {
    pub async fn next_message(&mut self) -> Envelope {
        self.reader.recv().await.expect("helper receive")
    }

    pub async fn send(&mut self, env: Envelope) {
        self.writer.send(env).await.expect("helper send");
    }

    /// Answer every request with `respond` until the service disconnects.
    /// The returned counter tracks how many requests arrived.
    pub fn respond_with<F>(mut self, mut respond: F) -> (Arc<AtomicUsize>, JoinHandle<()>)
    where
        F: FnMut(&Envelope) -> Envelope + Send + 'static,
    {
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        let handle = tokio::spawn(async move {
            while let Ok(env) = self.reader.recv().await {
                match env.kind {
                    MessageType::Disconnect => break,
                    MessageType::Command
                    | MessageType::Notify
                    | MessageType::DesktopStart
                    | MessageType::DesktopStop => {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let reply = respond(&env);
                        if self.writer.send(reply).await.is_err() {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        });
        (received, handle)
    }
}

/// Connect a fake helper with the given capabilities and scopes.
pub async fn attach_fake_helper(
    broker: &Arc<SessionBroker>,
    identity: SessionIdentity,
    capabilities: &[&str],
    scopes: &[&str],
) -> FakeHelper {
    let (service_io, helper_io) = duplex(256 * 1024);
    let (service_read, service_write) = split(service_io);
    let (helper_read, helper_write) = split(helper_io);
    let (service_reader, service_writer, _) = framed(service_read, service_write);
    let (reader, writer, _) = framed(helper_read, helper_write);

    let session = HelperSession::new(
        SessionParams {
            identity,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            pid: std::process::id(),
            display_env: ":0".to_string(),
        },
        service_writer.boxed(),
    );
    session.set_capabilities(capabilities.iter().copied());
    broker.attach(session.clone(), service_reader).await;

    FakeHelper {
        session,
        reader,
        writer,
    }
}

/// `SystemTools` that records each command type and reports it ran locally.
#[derive(Default)]
pub struct RecordingTools {
    calls: Mutex<Vec<String>>,
}

impl RecordingTools {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SystemTools for RecordingTools {
    async fn run(&self, command: &Command) -> CommandResult {
        self.calls.lock().push(command.command_type.clone());
        CommandResult::success(&json!({"type": command.command_type, "local": true}), 0)
    }
}

/// `ScriptExecutor` returning a canned output and remembering what it was asked to run.
#[derive(Default)]
pub struct StubExecutor {
    exit_code: i32,
    stdout: String,
    error: Option<String>,
    executed: Mutex<Vec<ScriptExecution>>,
}

impl StubExecutor {
    pub fn with_output(exit_code: i32, stdout: impl Into<String>, error: Option<&str>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            error: error.map(str::to_string),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn executed(&self) -> Vec<ScriptExecution> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl ScriptExecutor for StubExecutor {
    async fn execute(&self, script: ScriptExecution) -> AgentResult<ScriptOutput> {
        let execution_id = script.id.clone();
        self.executed.lock().push(script);
        let now = Utc::now();
        Ok(ScriptOutput {
            execution_id,
            exit_code: self.exit_code,
            stdout: self.stdout.clone(),
            stderr: String::new(),
            error: self.error.clone(),
            timed_out: false,
            started_at: now,
            completed_at: now,
        })
    }

    async fn cancel(&self, execution_id: &str) -> AgentResult<()> {
        Err(anyhow::anyhow!("execution {execution_id} not found").into())
    }

    fn list_running(&self) -> Vec<RunningScript> {
        Vec::new()
    }
}

/// Session detector with a fixed session list.
pub struct StaticDetector(pub Vec<DetectedSession>);

#[async_trait]
impl SessionDetector for StaticDetector {
    async fn list_sessions(&self) -> anyhow::Result<Vec<DetectedSession>> {
        Ok(self.0.clone())
    }
}

type LaunchFn = dyn Fn(&DetectedSession) -> anyhow::Result<()> + Send + Sync;

/// Launcher that counts launches and delegates the outcome to a closure.
pub struct TestLauncher {
    launches: AtomicUsize,
    on_launch: Box<LaunchFn>,
}

impl TestLauncher {
    pub fn new<F>(on_launch: F) -> Self
    where
        F: Fn(&DetectedSession) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            launches: AtomicUsize::new(0),
            on_launch: Box::new(on_launch),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(|_| Ok(()))
    }

    pub fn failing(reason: &'static str) -> Self {
        Self::new(move |_| Err(anyhow::anyhow!(reason)))
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HelperLauncher for TestLauncher {
    async fn spawn_helper_in_session(&self, session: &DetectedSession) -> anyhow::Result<()> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        (self.on_launch)(session)
    }
}

/// An active graphical login session.
pub fn interactive_session(id: &str, uid: u32, username: &str) -> DetectedSession {
    DetectedSession {
        session: id.to_string(),
        uid,
        username: username.to_string(),
        state: "active".to_string(),
        session_type: "x11".to_string(),
        display: ":0".to_string(),
        seat: "seat0".to_string(),
        remote: false,
    }
}
