//! Launching user helpers inside interactive login sessions.
//!
//! The spawner only launches. Waiting for the helper to connect back is the
//! router's job.

pub mod launcher;
pub mod loginctl;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

pub use launcher::{RunuserLauncher, UnsupportedLauncher};
pub use loginctl::LoginctlDetector;

use crate::broker::TargetHint;

/// An OS login session as reported by the platform session manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedSession {
    pub session: String,
    pub uid: u32,
    pub username: String,
    pub state: String,
    #[serde(rename = "type")]
    pub session_type: String,
    pub display: String,
    pub seat: String,
    pub remote: bool,
}

impl DetectedSession {
    /// Has a desktop a helper can attach to.
    pub fn is_interactive(&self) -> bool {
        !matches!(
            self.session_type.as_str(),
            "services" | "background" | "unspecified" | ""
        ) && matches!(self.state.as_str(), "active" | "online")
    }
}

#[async_trait]
pub trait SessionDetector: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<DetectedSession>>;
}

#[async_trait]
pub trait HelperLauncher: Send + Sync {
    /// Start `<exe> user-helper` as the session's user. Returns once launched.
    async fn spawn_helper_in_session(&self, session: &DetectedSession) -> Result<()>;
}

pub struct HelperSpawner {
    detector: Arc<dyn SessionDetector>,
    launcher: Arc<dyn HelperLauncher>,
}

impl HelperSpawner {
    pub fn new(detector: Arc<dyn SessionDetector>, launcher: Arc<dyn HelperLauncher>) -> Self {
        Self { detector, launcher }
    }

    /// Spawner for the current platform; launched helpers connect to `socket_path`.
    pub fn for_platform(socket_path: PathBuf) -> Result<Self> {
        let detector: Arc<dyn SessionDetector> = Arc::new(LoginctlDetector::default());
        let launcher: Arc<dyn HelperLauncher> = if cfg!(target_os = "linux") {
            Arc::new(RunuserLauncher::for_current_exe()?.with_socket_path(socket_path))
        } else {
            Arc::new(UnsupportedLauncher)
        };
        Ok(Self::new(detector, launcher))
    }

    pub async fn list_sessions(&self) -> Result<Vec<DetectedSession>> {
        self.detector.list_sessions().await
    }

    /// Explicit session id if given, otherwise the first interactive session.
    pub async fn resolve_target(&self, target: &TargetHint) -> Result<DetectedSession> {
        let sessions = self.detector.list_sessions().await?;
        let found = match target {
            TargetHint::OsSession(id) => sessions.into_iter().find(|s| s.session == *id),
            TargetHint::User(name) => sessions
                .into_iter()
                .find(|s| s.username == *name && s.is_interactive()),
            TargetHint::Any => sessions.into_iter().find(DetectedSession::is_interactive),
        };
        found.ok_or_else(|| match target {
            TargetHint::OsSession(id) => anyhow!("session {id} not found"),
            TargetHint::User(name) => anyhow!("no interactive session for user {name}"),
            TargetHint::Any => anyhow!("no interactive user session found"),
        })
    }

    pub async fn spawn_for_target(&self, target: &TargetHint) -> Result<DetectedSession> {
        let session = self.resolve_target(target).await?;
        info!(
            session = %session.session,
            username = %session.username,
            "Spawning user helper"
        );
        self.launcher.spawn_helper_in_session(&session).await?;
        Ok(session)
    }
}
