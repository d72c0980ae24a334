//! One authenticated helper connection and its request/reply correlation table.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use outpost_traits::AgentError;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::identity::SessionIdentity;
use crate::ipc::{BoxedWriter, CodecError, Envelope, EnvelopeReader, EnvelopeWriter, MessageType};

const DISCONNECT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
/// Bound for writes that have no caller-supplied timeout.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session closed while waiting for response")]
    Closed,

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("request {0} is already pending")]
    DuplicateId(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<SessionError> for AgentError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Timeout(_) => AgentError::Timeout(err.to_string()),
            SessionError::Closed | SessionError::Codec(_) => AgentError::Transport(err.to_string()),
            SessionError::DuplicateId(_) | SessionError::Encode(_) => {
                AgentError::Validation(err.to_string())
            }
        }
    }
}

/// Connection details fixed at authentication time.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub identity: SessionIdentity,
    pub scopes: Vec<String>,
    pub pid: u32,
    pub display_env: String,
}

/// Serializable snapshot of a session, for listings and logs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub identity: SessionIdentity,
    pub connection_seq: u64,
    pub pid: u32,
    pub display_env: String,
    pub capabilities: Vec<String>,
    pub scopes: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub idle_secs: u64,
}

pub struct HelperSession {
    identity: SessionIdentity,
    scopes: HashSet<String>,
    pid: u32,
    display_env: String,
    capabilities: RwLock<HashSet<String>>,
    writer: tokio::sync::Mutex<EnvelopeWriter<BoxedWriter>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    connection_seq: AtomicU64,
    connected_at: DateTime<Utc>,
    last_seen: Mutex<Instant>,
}

impl HelperSession {
    pub fn new(params: SessionParams, writer: EnvelopeWriter<BoxedWriter>) -> Arc<Self> {
        Arc::new(Self {
            identity: params.identity,
            scopes: params.scopes.into_iter().collect(),
            pid: params.pid,
            display_env: params.display_env,
            capabilities: RwLock::new(HashSet::new()),
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            connection_seq: AtomicU64::new(0),
            connected_at: Utc::now(),
            last_seen: Mutex::new(Instant::now()),
        })
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn connection_seq(&self) -> u64 {
        self.connection_seq.load(Ordering::Acquire)
    }

    pub(crate) fn set_connection_seq(&self, seq: u64) {
        self.connection_seq.store(seq, Ordering::Release);
    }

    /// Exact scope or the `*` wildcard.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope) || self.scopes.contains("*")
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.read().contains(capability)
    }

    pub fn set_capabilities<I, S>(&self, capabilities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.capabilities.write() = capabilities.into_iter().map(Into::into).collect();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_duration(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn info(&self) -> SessionInfo {
        let mut capabilities: Vec<String> = self.capabilities.read().iter().cloned().collect();
        capabilities.sort();
        let mut scopes: Vec<String> = self.scopes.iter().cloned().collect();
        scopes.sort();
        SessionInfo {
            identity: self.identity.clone(),
            connection_seq: self.connection_seq(),
            pid: self.pid,
            display_env: self.display_env.clone(),
            capabilities,
            scopes,
            connected_at: self.connected_at,
            idle_secs: self.idle_duration().as_secs(),
        }
    }

    /// Send a request and wait for the envelope carrying the same id.
    ///
    /// Fails on timeout, on close, or when `id` is already outstanding. The
    /// pending entry is removed on every exit path.
    pub async fn send_command<T: Serialize>(
        &self,
        id: &str,
        kind: MessageType,
        payload: &T,
        timeout: Duration,
    ) -> Result<Envelope, SessionError> {
        let env = Envelope::new(id, kind, payload)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if self.is_closed() {
                return Err(SessionError::Closed);
            }
            if pending.contains_key(id) {
                return Err(SessionError::DuplicateId(id.to_string()));
            }
            pending.insert(id.to_string(), tx);
        }
        scopeguard::defer! {
            self.pending.lock().remove(id);
        }

        let deadline = Instant::now() + timeout;
        self.write_before(env, deadline, timeout).await?;

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => Err(SessionError::Timeout(timeout)),
        }
    }

    /// Fire-and-forget message; no reply is awaited.
    pub async fn send_notify<T: Serialize>(
        &self,
        id: &str,
        kind: MessageType,
        payload: &T,
    ) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let env = Envelope::new(id, kind, payload)?;
        self.write_before(env, Instant::now() + WRITE_TIMEOUT, WRITE_TIMEOUT)
            .await
    }

    pub async fn reply(&self, env: Envelope) -> Result<(), SessionError> {
        self.write_before(env, Instant::now() + WRITE_TIMEOUT, WRITE_TIMEOUT)
            .await
    }

    /// Lock and write under `deadline`. A helper that stops reading leaves a
    /// partial frame behind, so the session is closed when the deadline hits.
    async fn write_before(
        &self,
        env: Envelope,
        deadline: Instant,
        budget: Duration,
    ) -> Result<(), SessionError> {
        let write = async {
            tokio::select! {
                _ = self.cancel.cancelled() => Err(SessionError::Closed),
                sent = async {
                    let mut writer = self.writer.lock().await;
                    writer.send(env).await
                } => sent.map_err(SessionError::from),
            }
        };
        match tokio::time::timeout_at(deadline, write).await {
            Ok(result) => result,
            Err(_) => {
                warn!(identity = %self.identity, "Helper stopped reading, closing session");
                self.close().await;
                Err(SessionError::Timeout(budget))
            }
        }
    }

    /// Single reader for this connection.
    ///
    /// Replies are matched to pending requests by id; everything else goes to
    /// `on_unsolicited`. Returns when the transport fails or the session is
    /// closed, and always leaves the session closed.
    pub async fn recv_loop<R, F, Fut>(&self, mut reader: EnvelopeReader<R>, mut on_unsolicited: F)
    where
        R: AsyncRead + Unpin,
        F: FnMut(Envelope) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            let env = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = reader.recv() => match received {
                    Ok(env) => env,
                    Err(CodecError::Closed) => {
                        debug!(identity = %self.identity, "Helper connection closed");
                        break;
                    }
                    Err(err) => {
                        warn!(identity = %self.identity, error = %err, "Helper receive failed");
                        break;
                    }
                },
            };

            self.touch();
            let waiter = self.pending.lock().remove(&env.id);
            match waiter {
                Some(tx) => {
                    if tx.send(env).is_err() {
                        debug!(identity = %self.identity, "Reply arrived after caller gave up");
                    }
                }
                None => on_unsolicited(env).await,
            }
        }

        self.close().await;
    }

    /// Idempotent. Releases every pending waiter with an error, stops the
    /// receive loop, and tells the helper to go away.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let released: Vec<_> = self.pending.lock().drain().collect();
        if !released.is_empty() {
            debug!(identity = %self.identity, count = released.len(), "Releasing pending requests");
        }
        drop(released);

        let goodbye = async {
            let mut writer = self.writer.lock().await;
            let _ = writer
                .send(Envelope::empty(uuid::Uuid::new_v4().to_string(), MessageType::Disconnect))
                .await;
            let _ = writer.shutdown().await;
        };
        if tokio::time::timeout(DISCONNECT_WRITE_TIMEOUT, goodbye).await.is_err() {
            debug!(identity = %self.identity, "Disconnect notice not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{IpcCommand, framed};
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};

    type HelperEnd = (
        EnvelopeReader<ReadHalf<DuplexStream>>,
        EnvelopeWriter<WriteHalf<DuplexStream>>,
    );

    fn session_pair(
        scopes: &[&str],
    ) -> (
        Arc<HelperSession>,
        EnvelopeReader<ReadHalf<DuplexStream>>,
        HelperEnd,
    ) {
        session_pair_with_buffer(scopes, 64 * 1024)
    }

    fn session_pair_with_buffer(
        scopes: &[&str],
        buffer: usize,
    ) -> (
        Arc<HelperSession>,
        EnvelopeReader<ReadHalf<DuplexStream>>,
        HelperEnd,
    ) {
        let (service_io, helper_io) = duplex(buffer);
        let (service_read, service_write) = split(service_io);
        let (helper_read, helper_write) = split(helper_io);
        let (service_reader, service_writer, _) = framed(service_read, service_write);
        let (helper_reader, helper_writer, _) = framed(helper_read, helper_write);
        let session = HelperSession::new(
            SessionParams {
                identity: SessionIdentity::new("1000", "alice", "2"),
                scopes: scopes.iter().map(|s| s.to_string()).collect(),
                pid: 42,
                display_env: ":0".into(),
            },
            service_writer.boxed(),
        );
        (session, service_reader, (helper_reader, helper_writer))
    }

    fn command(id: &str) -> IpcCommand {
        IpcCommand {
            command_id: id.into(),
            command_type: "take_screenshot".into(),
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn test_send_command_receives_matching_reply() {
        let (session, reader, (mut helper_reader, mut helper_writer)) = session_pair(&[]);
        let loop_session = session.clone();
        tokio::spawn(async move { loop_session.recv_loop(reader, |_| async {}).await });

        tokio::spawn(async move {
            let req = helper_reader.recv().await.unwrap();
            let reply = Envelope::new(req.id, MessageType::CommandResult, &json!({"ok": true})).unwrap();
            helper_writer.send(reply).await.unwrap();
        });

        let reply = session
            .send_command("c-1", MessageType::Command, &command("c-1"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply.kind, MessageType::CommandResult);
        assert_eq!(reply.payload["ok"], true);
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command_times_out_without_reply() {
        let (session, reader, _helper) = session_pair(&[]);
        let loop_session = session.clone();
        tokio::spawn(async move { loop_session.recv_loop(reader, |_| async {}).await });

        let started = Instant::now();
        let err = session
            .send_command("c-1", MessageType::Command, &command("c-1"), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_pending_waiters() {
        let (session, reader, _helper) = session_pair(&[]);
        let loop_session = session.clone();
        tokio::spawn(async move { loop_session.recv_loop(reader, |_| async {}).await });

        let waiter = session.clone();
        let call = tokio::spawn(async move {
            waiter
                .send_command("c-1", MessageType::Command, &command("c-1"), Duration::from_secs(60))
                .await
        });
        while session.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        session.close().await;
        let result = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("waiter released promptly")
            .unwrap();
        assert!(matches!(result, Err(SessionError::Closed)));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_duplicate_pending_id_rejected() {
        let (session, reader, _helper) = session_pair(&[]);
        let loop_session = session.clone();
        tokio::spawn(async move { loop_session.recv_loop(reader, |_| async {}).await });

        let first = session.clone();
        tokio::spawn(async move {
            let _ = first
                .send_command("dup", MessageType::Command, &command("dup"), Duration::from_secs(60))
                .await;
        });
        while session.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        let err = session
            .send_command("dup", MessageType::Command, &command("dup"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn test_unsolicited_messages_forwarded() {
        let (session, reader, (_helper_reader, mut helper_writer)) = session_pair(&[]);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let loop_session = session.clone();
        tokio::spawn(async move {
            loop_session
                .recv_loop(reader, move |env| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(env.kind);
                    }
                })
                .await
        });

        helper_writer.send(Envelope::empty("p-1", MessageType::Ping)).await.unwrap();
        assert_eq!(rx.recv().await, Some(MessageType::Ping));
    }

    #[tokio::test]
    async fn test_recv_loop_closes_session_on_eof() {
        let (session, reader, helper) = session_pair(&[]);
        drop(helper);
        session.recv_loop(reader, |_| async {}).await;
        assert!(session.is_closed());
    }

    fn large_command(id: &str) -> IpcCommand {
        IpcCommand {
            command_id: id.into(),
            command_type: "script".into(),
            payload: json!({"content": "x".repeat(4096)}),
        }
    }

    #[tokio::test]
    async fn test_close_releases_caller_stuck_writing() {
        // The helper end is kept alive but never read, so the 64-byte pipe fills.
        let (session, reader, _helper) = session_pair_with_buffer(&[], 64);
        let loop_session = session.clone();
        tokio::spawn(async move { loop_session.recv_loop(reader, |_| async {}).await });

        let caller = session.clone();
        let call = tokio::spawn(async move {
            caller
                .send_command("big", MessageType::Command, &large_command("big"), Duration::from_secs(60))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!call.is_finished());

        session.close().await;
        let result = tokio::time::timeout(Duration::from_secs(3), call)
            .await
            .expect("stuck writer released by close")
            .unwrap();
        assert!(matches!(result, Err(SessionError::Closed)));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_counts_against_timeout() {
        let (session, reader, _helper) = session_pair_with_buffer(&[], 64);
        let loop_session = session.clone();
        tokio::spawn(async move { loop_session.recv_loop(reader, |_| async {}).await });

        let started = Instant::now();
        let err = session
            .send_command("big", MessageType::Command, &large_command("big"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_to_stalled_helper_is_bounded() {
        let (session, _reader, _helper) = session_pair_with_buffer(&[], 64);
        let payload = json!({"body": "y".repeat(4096)});
        let err = session
            .send_notify("n-1", MessageType::Notify, &payload)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_scope_wildcard() {
        let (narrow, _, _) = session_pair(&["notify"]);
        assert!(narrow.has_scope("notify"));
        assert!(!narrow.has_scope("run_as_user"));

        let (wide, _, _) = session_pair(&["*"]);
        assert!(wide.has_scope("run_as_user"));
    }
}
