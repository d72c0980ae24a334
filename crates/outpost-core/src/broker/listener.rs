use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::SessionBroker;
use super::identity::SessionIdentity;
use super::session::{HelperSession, SessionParams};
use crate::ipc::{
    AuthRequest, AuthResponse, CodecError, Envelope, EnvelopeReader, EnvelopeWriter, MessageType,
    PROTOCOL_VERSION, RateLimiter, SessionKey, framed,
};

pub const DEFAULT_SCOPES: &[&str] = &["notify", "tray", "clipboard", "desktop", "run_as_user"];

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub socket_path: PathBuf,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub idle_check_interval: Duration,
    pub max_sessions_per_principal: usize,
    pub rate_limit_attempts: usize,
    pub rate_limit_window: Duration,
    pub allowed_scopes: Vec<String>,
    /// When set, helpers must present this executable hash.
    pub expected_binary_hash: Option<String>,
}

impl ListenerConfig {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30 * 60),
            idle_check_interval: Duration::from_secs(60),
            max_sessions_per_principal: 3,
            rate_limit_attempts: 5,
            rate_limit_window: Duration::from_secs(60),
            allowed_scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            expected_binary_hash: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("too many connection attempts for uid {0}")]
    RateLimited(u32),

    #[error("handshake timed out")]
    Timeout,

    #[error("expected auth_request, got {0}")]
    UnexpectedMessage(MessageType),

    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("decode auth request: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("peer credentials: {0}")]
    PeerCredentials(#[from] std::io::Error),
}

/// Kernel-reported identity of the connecting process.
#[derive(Debug, Clone, Copy)]
pub struct PeerCredentials {
    pub uid: u32,
    pub pid: Option<u32>,
}

/// Accepts helper connections on the broker socket and registers them after
/// a successful handshake.
pub struct BrokerListener {
    config: ListenerConfig,
    broker: Arc<SessionBroker>,
    limiter: RateLimiter,
}

impl BrokerListener {
    pub fn new(config: ListenerConfig, broker: Arc<SessionBroker>) -> Self {
        let limiter = RateLimiter::new(config.rate_limit_attempts, config.rate_limit_window);
        Self {
            config,
            broker,
            limiter,
        }
    }

    pub fn broker(&self) -> &Arc<SessionBroker> {
        &self.broker
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        if self.config.socket_path.exists() {
            std::fs::remove_file(&self.config.socket_path)?;
        }
        if let Some(parent) = self.config.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.config.socket_path)?;

        // Helpers run as unprivileged users; peer credentials gate access instead.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                &self.config.socket_path,
                std::fs::Permissions::from_mode(0o666),
            )?;
        }

        info!(path = %self.config.socket_path.display(), "Session broker listening");

        let mut reaper = tokio::time::interval(self.config.idle_check_interval);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let this = self.clone();
                            tokio::spawn(async move {
                                if let Err(err) = this.handle_connection(stream).await {
                                    warn!(error = %err, "Helper handshake failed");
                                }
                            });
                        }
                        Err(err) => error!(error = %err, "Broker accept error"),
                    }
                }
                _ = reaper.tick() => {
                    let reaped = self.broker.reap_idle(self.config.idle_timeout).await;
                    if reaped > 0 {
                        info!(count = reaped, "Reaped idle helper sessions");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Session broker shutting down");
                    break;
                }
            }
        }

        self.broker.close_all().await;
        let _ = std::fs::remove_file(&self.config.socket_path);
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream) -> Result<(), HandshakeError> {
        let cred = stream.peer_cred()?;
        let peer = PeerCredentials {
            uid: cred.uid(),
            pid: cred.pid().and_then(|pid| u32::try_from(pid).ok()),
        };

        if !self.limiter.allow(&peer.uid.to_string()) {
            return Err(HandshakeError::RateLimited(peer.uid));
        }

        let (read, write) = stream.into_split();
        let (mut reader, mut writer, key) = framed(read, write);
        let params = tokio::time::timeout(
            self.config.handshake_timeout,
            self.authenticate(&mut reader, &mut writer, &key, peer),
        )
        .await
        .map_err(|_| HandshakeError::Timeout)??;

        let session = HelperSession::new(params, writer.boxed());
        self.broker.attach(session, reader).await;
        Ok(())
    }

    /// Run the auth exchange. On success the session key is installed on both halves.
    pub async fn authenticate<R, W>(
        &self,
        reader: &mut EnvelopeReader<R>,
        writer: &mut EnvelopeWriter<W>,
        key: &SessionKey,
        peer: PeerCredentials,
    ) -> Result<SessionParams, HandshakeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let env = reader.recv().await?;
        if env.kind != MessageType::AuthRequest {
            return Err(HandshakeError::UnexpectedMessage(env.kind));
        }
        let request: AuthRequest = env.decode()?;

        if let Err(reason) = self.check_request(&request, peer) {
            warn!(uid = peer.uid, reason = %reason, "Rejecting helper");
            let reply = Envelope::new(&env.id, MessageType::AuthResponse, &AuthResponse::rejected(&reason))?;
            writer.send(reply).await?;
            return Err(HandshakeError::Rejected(reason));
        }

        let session_key = SessionKey::generate();
        let response = AuthResponse {
            accepted: true,
            session_key: hex::encode(session_key),
            allowed_scopes: self.config.allowed_scopes.clone(),
            reason: String::new(),
        };
        writer
            .send(Envelope::new(&env.id, MessageType::AuthResponse, &response)?)
            .await?;
        key.set(session_key);

        let principal = request.principal();
        let username = resolve_username(peer.uid).unwrap_or(request.username);
        let identity = SessionIdentity::new(principal, username, request.session_id);
        info!(
            identity = %identity,
            pid = request.pid,
            peer_pid = ?peer.pid,
            "Helper authenticated"
        );

        Ok(SessionParams {
            identity,
            scopes: self.config.allowed_scopes.clone(),
            pid: request.pid,
            display_env: request.display_env,
        })
    }

    fn check_request(&self, request: &AuthRequest, peer: PeerCredentials) -> Result<(), String> {
        if request.protocol_version != PROTOCOL_VERSION {
            return Err(format!(
                "unsupported protocol version {}",
                request.protocol_version
            ));
        }
        if request.uid != peer.uid {
            return Err(format!(
                "uid mismatch: peer {}, claimed {}",
                peer.uid, request.uid
            ));
        }
        let principal = request.principal();
        let live = self
            .broker
            .all_sessions()
            .iter()
            .filter(|s| {
                s.identity().principal == principal && s.identity().os_session != request.session_id
            })
            .count();
        if live >= self.config.max_sessions_per_principal {
            return Err(format!("too many helper sessions for uid {}", peer.uid));
        }
        if let Some(expected) = &self.config.expected_binary_hash
            && !expected.eq_ignore_ascii_case(&request.binary_hash)
        {
            return Err("binary hash mismatch".to_string());
        }
        debug!(uid = peer.uid, "Helper request passed checks");
        Ok(())
    }
}

#[cfg(unix)]
fn resolve_username(uid: u32) -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|user| user.name)
}

#[cfg(not(unix))]
fn resolve_username(_uid: u32) -> Option<String> {
    None
}
