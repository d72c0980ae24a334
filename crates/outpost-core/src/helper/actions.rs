use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Result, bail};
use async_trait::async_trait;
use outpost_traits::{Command, CommandResult};
use parking_lot::Mutex;
use tokio::process::Command as Process;
use tracing::{debug, info, warn};

use crate::ipc::{
    Capabilities, DesktopStartRequest, DesktopStartResponse, NotifyRequest, NotifyResult,
    TrayUpdate,
};

/// Desktop-bound actions a helper performs inside its login session.
#[async_trait]
pub trait HelperActions: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// `take_screenshot` and `computer_action`.
    async fn run_tool(&self, command: &Command) -> CommandResult;

    async fn notify(&self, request: &NotifyRequest) -> NotifyResult;

    fn update_tray(&self, update: &TrayUpdate);

    async fn start_desktop(&self, request: &DesktopStartRequest) -> Result<DesktopStartResponse>;

    async fn stop_desktop(&self, session_id: &str);
}

/// Display server of the current session, e.g. `x11::0` or `wayland:wayland-0`.
pub fn detect_display_env() -> String {
    if cfg!(target_os = "macos") {
        return "quartz".to_string();
    }
    if cfg!(windows) {
        return "windows".to_string();
    }
    let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
    if let Some(display) = var("WAYLAND_DISPLAY") {
        return format!("wayland:{display}");
    }
    if let Some(display) = var("DISPLAY") {
        return format!("x11:{display}");
    }
    String::new()
}

/// Actions backed by desktop utilities found on `PATH`.
///
/// Notifications go through `notify-send`. Screen capture and input are only
/// offered when a capture command is configured; it receives the tool name in
/// `OUTPOST_TOOL` and the JSON payload in `OUTPOST_PAYLOAD`, and its stdout
/// becomes the command output.
pub struct LocalHelperActions {
    display_env: String,
    notify_send: Option<PathBuf>,
    capture_command: Option<String>,
    tray: Mutex<Option<TrayUpdate>>,
}

impl LocalHelperActions {
    pub fn detect() -> Self {
        let notify_send = which::which("notify-send").ok();
        if notify_send.is_none() {
            debug!("notify-send not found, notifications disabled");
        }
        Self {
            display_env: detect_display_env(),
            notify_send,
            capture_command: None,
            tray: Mutex::new(None),
        }
    }

    pub fn with_capture_command(mut self, command: Option<String>) -> Self {
        self.capture_command = command.filter(|c| !c.trim().is_empty());
        self
    }

    /// Last tray state pushed by the service.
    pub fn tray_state(&self) -> Option<TrayUpdate> {
        self.tray.lock().clone()
    }

    fn has_display(&self) -> bool {
        !self.display_env.is_empty()
    }
}

#[async_trait]
impl HelperActions for LocalHelperActions {
    fn capabilities(&self) -> Capabilities {
        let display = self.has_display();
        Capabilities {
            can_notify: display && self.notify_send.is_some(),
            can_tray: display,
            can_capture: display && self.capture_command.is_some(),
            can_clipboard: false,
            display_server: self.display_env.clone(),
        }
    }

    async fn run_tool(&self, command: &Command) -> CommandResult {
        let Some(capture) = &self.capture_command else {
            return CommandResult::failed("screen capture not available in this session", 0);
        };

        let payload = serde_json::Value::Object(command.payload.clone()).to_string();
        let output = Process::new("sh")
            .arg("-c")
            .arg(capture)
            .env("OUTPOST_TOOL", &command.command_type)
            .env("OUTPOST_PAYLOAD", payload)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => CommandResult {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                ..Default::default()
            },
            Ok(output) => CommandResult {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                ..CommandResult::failed(format!("{} failed: {}", command.command_type, output.status), 0)
            },
            Err(err) => CommandResult::failed(format!("run capture command: {err}"), 0),
        }
    }

    async fn notify(&self, request: &NotifyRequest) -> NotifyResult {
        let Some(notify_send) = &self.notify_send else {
            return NotifyResult::default();
        };

        let mut cmd = Process::new(notify_send);
        if !request.urgency.is_empty() {
            cmd.arg("-u").arg(&request.urgency);
        }
        if !request.icon.is_empty() {
            cmd.arg("-i").arg(&request.icon);
        }
        cmd.arg(&request.title).arg(&request.body);

        match cmd.status().await {
            Ok(status) if status.success() => NotifyResult {
                delivered: true,
                action_clicked: None,
            },
            Ok(status) => {
                warn!(%status, "notify-send failed");
                NotifyResult::default()
            }
            Err(err) => {
                warn!(error = %err, "notify-send failed");
                NotifyResult::default()
            }
        }
    }

    fn update_tray(&self, update: &TrayUpdate) {
        info!(status = %update.status, items = update.menu_items.len(), "Tray updated");
        *self.tray.lock() = Some(update.clone());
    }

    async fn start_desktop(&self, _request: &DesktopStartRequest) -> Result<DesktopStartResponse> {
        bail!("remote desktop not available in this session")
    }

    async fn stop_desktop(&self, session_id: &str) {
        debug!(session_id, "No desktop session to stop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actions(display: &str, capture: Option<&str>) -> LocalHelperActions {
        LocalHelperActions {
            display_env: display.to_string(),
            notify_send: None,
            capture_command: capture.map(str::to_string),
            tray: Mutex::new(None),
        }
    }

    #[test]
    fn test_capabilities_follow_display_and_tools() {
        let caps = actions("", Some("true")).capabilities();
        assert!(caps.tags().is_empty());

        let caps = actions("x11::0", None).capabilities();
        assert_eq!(caps.tags(), vec!["tray"]);

        let caps = actions("x11::0", Some("true")).capabilities();
        assert_eq!(caps.tags(), vec!["tray", "capture"]);
    }

    #[tokio::test]
    async fn test_capture_unavailable_without_command() {
        let result = actions("x11::0", None)
            .run_tool(&Command::new("1", "take_screenshot"))
            .await;
        assert_eq!(result.error, "screen capture not available in this session");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_command_receives_tool_and_payload() {
        let actions = actions("x11::0", Some("printf '%s %s' \"$OUTPOST_TOOL\" \"$OUTPOST_PAYLOAD\""));
        let cmd = Command::new("1", "computer_action")
            .with_payload(serde_json::json!({"action": "click"}));
        let result = actions.run_tool(&cmd).await;
        assert!(result.is_success());
        assert_eq!(result.stdout, r#"computer_action {"action":"click"}"#);
    }

    #[tokio::test]
    async fn test_notify_without_notify_send_not_delivered() {
        let result = actions("x11::0", None)
            .notify(&NotifyRequest {
                body: "hi".into(),
                ..Default::default()
            })
            .await;
        assert!(!result.delivered);
    }

    #[test]
    fn test_tray_state_kept() {
        let actions = actions("x11::0", None);
        actions.update_tray(&TrayUpdate {
            status: "warning".into(),
            ..Default::default()
        });
        assert_eq!(actions.tray_state().unwrap().status, "warning");
    }
}
