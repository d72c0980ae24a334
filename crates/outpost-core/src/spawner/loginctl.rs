use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{DetectedSession, SessionDetector};

/// Enumerates systemd-logind sessions through `loginctl`.
#[derive(Debug, Clone)]
pub struct LoginctlDetector {
    program: String,
}

impl Default for LoginctlDetector {
    fn default() -> Self {
        Self {
            program: "loginctl".to_string(),
        }
    }
}

impl LoginctlDetector {
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("run {} {}", self.program, args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "{} {} failed: {}",
                self.program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SessionDetector for LoginctlDetector {
    async fn list_sessions(&self) -> Result<Vec<DetectedSession>> {
        let listing = self
            .run(&["list-sessions", "--no-legend", "--no-pager"])
            .await?;

        let mut sessions = Vec::new();
        for mut session in parse_session_list(&listing) {
            match self
                .run(&[
                    "show-session",
                    &session.session,
                    "--property=Type,Remote,Display,Seat,State",
                ])
                .await
            {
                Ok(properties) => {
                    apply_session_properties(&mut session, &properties);
                    sessions.push(session);
                }
                Err(err) => debug!(session = %session.session, error = %err, "Skipping session"),
            }
        }
        Ok(sessions)
    }
}

/// Parse `loginctl list-sessions --no-legend`: `SESSION UID USER [SEAT ...]`.
pub fn parse_session_list(output: &str) -> Vec<DetectedSession> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let session = fields.next()?;
            let uid = fields.next()?.parse().ok()?;
            let username = fields.next()?;
            Some(DetectedSession {
                session: session.to_string(),
                uid,
                username: username.to_string(),
                ..Default::default()
            })
        })
        .collect()
}

/// Apply `Key=Value` lines from `loginctl show-session`.
pub fn apply_session_properties(session: &mut DetectedSession, output: &str) {
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "Type" => session.session_type = value,
            "Remote" => session.remote = value == "yes",
            "Display" => session.display = value,
            "Seat" => session.seat = value,
            "State" => session.state = value,
            _ => {}
        }
    }
}
