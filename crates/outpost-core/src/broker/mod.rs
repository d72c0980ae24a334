//! Registry of connected user-helper sessions.
//!
//! The broker owns the identity → session table shared by every routed command.
//! Lookups take a read lock for the duration of a map scan only; sends, closes,
//! and waits all happen after the lock is released.

pub mod identity;
pub mod listener;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use identity::{SessionIdentity, TargetHint};
pub use listener::{BrokerListener, ListenerConfig};
pub use session::{HelperSession, SessionError, SessionInfo, SessionParams};

use crate::ipc::{Capabilities, Envelope, EnvelopeReader, MessageType};

/// Callback for helper-initiated messages the broker does not handle itself.
pub type MessageHandler = Arc<dyn Fn(&SessionIdentity, Envelope) + Send + Sync>;

pub struct SessionBroker {
    sessions: RwLock<HashMap<SessionIdentity, Arc<HelperSession>>>,
    next_seq: AtomicU64,
    /// Bumped on every connect and capability change.
    generation: watch::Sender<u64>,
    on_message: RwLock<Option<MessageHandler>>,
}

impl Default for SessionBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBroker {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            generation,
            on_message: RwLock::new(None),
        }
    }

    pub fn set_message_handler(&self, handler: MessageHandler) {
        *self.on_message.write() = Some(handler);
    }

    /// Register a session, superseding any live session for the same identity.
    pub async fn connect(&self, session: Arc<HelperSession>) {
        session.set_connection_seq(self.next_seq.fetch_add(1, Ordering::AcqRel));
        let previous = self
            .sessions
            .write()
            .insert(session.identity().clone(), session.clone());
        self.bump_generation();

        info!(
            identity = %session.identity(),
            seq = session.connection_seq(),
            "Helper session registered"
        );

        if let Some(previous) = previous
            && !Arc::ptr_eq(&previous, &session)
        {
            info!(identity = %previous.identity(), "Superseding previous helper session");
            previous.close().await;
        }
    }

    /// Remove `session` if it is still the registered one for its identity.
    pub fn disconnect(&self, session: &Arc<HelperSession>) -> bool {
        let mut sessions = self.sessions.write();
        let is_current = sessions
            .get(session.identity())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if is_current {
            sessions.remove(session.identity());
            info!(identity = %session.identity(), "Helper session removed");
        }
        is_current
    }

    /// Register a session and spawn its receive loop, which deregisters it on exit.
    pub async fn attach<R>(
        self: &Arc<Self>,
        session: Arc<HelperSession>,
        reader: EnvelopeReader<R>,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.connect(session.clone()).await;
        let broker = self.clone();
        tokio::spawn(async move {
            let handler_broker = broker.clone();
            let handler_session = session.clone();
            session
                .recv_loop(reader, move |env| {
                    let broker = handler_broker.clone();
                    let session = handler_session.clone();
                    async move { broker.handle_unsolicited(&session, env).await }
                })
                .await;
            broker.disconnect(&session);
        })
    }

    async fn handle_unsolicited(&self, session: &Arc<HelperSession>, env: Envelope) {
        match env.kind {
            MessageType::Ping => {
                if let Err(err) = session.reply(Envelope::empty(env.id, MessageType::Pong)).await {
                    debug!(identity = %session.identity(), error = %err, "Pong failed");
                }
            }
            MessageType::Capabilities => match env.decode::<Capabilities>() {
                Ok(caps) => {
                    let tags = caps.tags();
                    info!(
                        identity = %session.identity(),
                        capabilities = ?tags,
                        display = %caps.display_server,
                        "Helper capabilities updated"
                    );
                    session.set_capabilities(tags);
                    self.bump_generation();
                }
                Err(err) => {
                    warn!(identity = %session.identity(), error = %err, "Invalid capabilities message");
                }
            },
            MessageType::Disconnect => {
                info!(identity = %session.identity(), "Helper requested disconnect");
                session.close().await;
            }
            _ => {
                let handler = self.on_message.read().clone();
                match handler {
                    Some(handler) => handler(session.identity(), env),
                    None => debug!(
                        identity = %session.identity(),
                        kind = %env.kind,
                        "Unhandled helper message"
                    ),
                }
            }
        }
    }

    fn bump_generation(&self) {
        self.generation.send_modify(|generation| *generation += 1);
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn session_for_identity(&self, identity: &SessionIdentity) -> Option<Arc<HelperSession>> {
        self.sessions
            .read()
            .get(identity)
            .filter(|s| !s.is_closed())
            .cloned()
    }

    /// Longest-connected live session for `username`.
    pub fn session_for_user(&self, username: &str) -> Option<Arc<HelperSession>> {
        self.find_session(&TargetHint::User(username.to_string()))
    }

    /// Snapshot of live sessions in connection order.
    pub fn all_sessions(&self) -> Vec<Arc<HelperSession>> {
        let mut sessions: Vec<_> = self
            .sessions
            .read()
            .values()
            .filter(|s| !s.is_closed())
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.connection_seq());
        sessions
    }

    pub fn session_infos(&self) -> Vec<SessionInfo> {
        self.all_sessions().iter().map(|s| s.info()).collect()
    }

    /// Longest-connected live session advertising `capability` within `target`.
    pub fn find_capable_session(
        &self,
        capability: &str,
        target: &TargetHint,
    ) -> Option<Arc<HelperSession>> {
        self.sessions
            .read()
            .values()
            .filter(|s| {
                !s.is_closed() && s.has_capability(capability) && target.matches(s.identity())
            })
            .min_by_key(|s| s.connection_seq())
            .cloned()
    }

    /// Longest-connected live session within `target`, regardless of capabilities.
    pub fn find_session(&self, target: &TargetHint) -> Option<Arc<HelperSession>> {
        self.sessions
            .read()
            .values()
            .filter(|s| !s.is_closed() && target.matches(s.identity()))
            .min_by_key(|s| s.connection_seq())
            .cloned()
    }

    /// Wait up to `budget` for `find` to return a session.
    ///
    /// Woken by connect and capability events, and re-checks at least every
    /// `poll` in case an event was missed.
    pub async fn wait_for<F>(
        &self,
        mut find: F,
        budget: Duration,
        poll: Duration,
    ) -> Option<Arc<HelperSession>>
    where
        F: FnMut(&Self) -> Option<Arc<HelperSession>>,
    {
        let deadline = Instant::now() + budget;
        let mut changes = self.subscribe();
        loop {
            if let Some(session) = find(self) {
                return Some(session);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wait = poll.min(deadline - now);
            if let Ok(Err(_)) = tokio::time::timeout(wait, changes.changed()).await {
                tokio::time::sleep(wait).await;
            }
        }
    }

    pub async fn wait_for_capable_session(
        &self,
        capability: &str,
        target: &TargetHint,
        budget: Duration,
        poll: Duration,
    ) -> Option<Arc<HelperSession>> {
        self.wait_for(
            |broker| broker.find_capable_session(capability, target),
            budget,
            poll,
        )
        .await
    }

    /// Fire-and-forget to every live session, concurrently. A helper that
    /// stops reading is dropped after the write timeout without holding up
    /// the others. Returns how many sends succeeded.
    pub async fn broadcast<T: Serialize>(&self, kind: MessageType, payload: &T) -> usize {
        let payload = match serde_json::to_value(payload) {
            Ok(payload) => Arc::new(payload),
            Err(err) => {
                warn!(kind = %kind, error = %err, "Broadcast payload not serializable");
                return 0;
            }
        };

        let mut sends = JoinSet::new();
        for session in self.all_sessions() {
            let payload = payload.clone();
            sends.spawn(async move {
                let id = format!("{}-{}", kind, uuid::Uuid::new_v4());
                let sent = session.send_notify(&id, kind, payload.as_ref()).await;
                if let Err(err) = &sent {
                    warn!(identity = %session.identity(), error = %err, "Broadcast send failed");
                }
                sent.is_ok()
            });
        }

        let mut delivered = 0;
        while let Some(sent) = sends.join_next().await {
            if matches!(sent, Ok(true)) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Close sessions idle longer than `idle_timeout`.
    pub async fn reap_idle(&self, idle_timeout: Duration) -> usize {
        let idle: Vec<_> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.idle_duration() > idle_timeout)
            .cloned()
            .collect();
        for session in &idle {
            info!(identity = %session.identity(), "Closing idle helper session");
            session.close().await;
            self.disconnect(session);
        }
        idle.len()
    }

    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }
}
