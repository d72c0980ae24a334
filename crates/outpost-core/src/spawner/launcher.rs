use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{DetectedSession, HelperLauncher};
use crate::paths;

const EARLY_EXIT_WINDOW: Duration = Duration::from_millis(150);

/// Starts `<exe> user-helper` as the session's user via `runuser`.
#[derive(Debug, Clone)]
pub struct RunuserLauncher {
    exe: PathBuf,
    log_dir: Option<PathBuf>,
    socket_path: Option<PathBuf>,
}

impl RunuserLauncher {
    pub fn new(exe: PathBuf, log_dir: Option<PathBuf>) -> Self {
        Self {
            exe,
            log_dir,
            socket_path: None,
        }
    }

    /// Broker socket the helper should connect to, passed as `OUTPOST_SOCKET`.
    pub fn with_socket_path(mut self, socket_path: PathBuf) -> Self {
        self.socket_path = Some(socket_path);
        self
    }

    pub fn for_current_exe() -> Result<Self> {
        let exe = std::env::current_exe().context("resolve current executable")?;
        Ok(Self::new(exe, paths::logs_dir().ok()))
    }

    fn command(&self, session: &DetectedSession) -> Result<Command> {
        let mut cmd = Command::new("runuser");
        cmd.arg("-u")
            .arg(&session.username)
            .arg("--")
            .arg(&self.exe)
            .arg("user-helper");
        cmd.env("XDG_SESSION_ID", &session.session);
        cmd.env("XDG_RUNTIME_DIR", format!("/run/user/{}", session.uid));
        if !session.display.is_empty() {
            cmd.env("DISPLAY", &session.display);
        }
        if let Some(socket) = &self.socket_path {
            cmd.env("OUTPOST_SOCKET", socket);
        }
        cmd.stdin(Stdio::null());

        match &self.log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let log = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(format!("helper-{}.log", session.session)))?;
                cmd.stdout(log.try_clone()?);
                cmd.stderr(log);
            }
            None => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
        }

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    nix::unistd::setsid()
                        .map(|_| ())
                        .map_err(std::io::Error::other)
                });
            }
        }

        Ok(cmd)
    }
}

#[async_trait]
impl HelperLauncher for RunuserLauncher {
    async fn spawn_helper_in_session(&self, session: &DetectedSession) -> Result<()> {
        if session.username.is_empty() {
            bail!("session {} has no user", session.session);
        }

        let mut child = self
            .command(session)?
            .spawn()
            .with_context(|| format!("launch helper for {}", session.username))?;
        let pid = child.id();

        // Detect immediate failures (bad user, missing runuser) before reporting success.
        tokio::time::sleep(EARLY_EXIT_WINDOW).await;
        if let Some(status) = child.try_wait()? {
            bail!("helper exited early with status {status}");
        }

        info!(pid = ?pid, session = %session.session, "User helper launched");
        let session_id = session.session.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(session = %session_id, %status, "User helper exited"),
                Err(err) => debug!(session = %session_id, error = %err, "User helper wait failed"),
            }
        });
        Ok(())
    }
}

/// Platforms without a session launcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedLauncher;

#[async_trait]
impl HelperLauncher for UnsupportedLauncher {
    async fn spawn_helper_in_session(&self, _session: &DetectedSession) -> Result<()> {
        bail!("helper spawning not supported on this platform")
    }
}
