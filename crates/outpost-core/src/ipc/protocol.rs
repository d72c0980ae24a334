use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Closed set of envelope types exchanged between the service and user helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    AuthRequest,
    AuthResponse,
    Command,
    CommandResult,
    Ping,
    Pong,
    Capabilities,
    Disconnect,
    Notify,
    NotifyResult,
    TrayUpdate,
    TrayAction,
    DesktopStart,
    DesktopStop,
    DesktopInput,
    ClipboardGet,
    ClipboardData,
    ClipboardSet,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::AuthRequest => "auth_request",
            MessageType::AuthResponse => "auth_response",
            MessageType::Command => "command",
            MessageType::CommandResult => "command_result",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Capabilities => "capabilities",
            MessageType::Disconnect => "disconnect",
            MessageType::Notify => "notify",
            MessageType::NotifyResult => "notify_result",
            MessageType::TrayUpdate => "tray_update",
            MessageType::TrayAction => "tray_action",
            MessageType::DesktopStart => "desktop_start",
            MessageType::DesktopStop => "desktop_stop",
            MessageType::DesktopInput => "desktop_input",
            MessageType::ClipboardGet => "clipboard_get",
            MessageType::ClipboardData => "clipboard_data",
            MessageType::ClipboardSet => "clipboard_set",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Framing unit on the local IPC socket.
///
/// `seq` and `hmac` are filled in by the codec on write; callers only set
/// the id, type, payload, and optional error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(default)]
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hmac: String,
}

impl Envelope {
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        kind: MessageType,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: id.into(),
            seq: 0,
            kind,
            payload: serde_json::to_value(payload)?,
            error: String::new(),
            hmac: String::new(),
        })
    }

    pub fn empty(id: impl Into<String>, kind: MessageType) -> Self {
        Self {
            id: id.into(),
            seq: 0,
            kind,
            payload: Value::Null,
            error: String::new(),
            hmac: String::new(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthRequest {
    pub protocol_version: u32,
    pub uid: u32,
    /// Windows security identifier; empty on Unix.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sid: String,
    pub username: String,
    pub session_id: String,
    pub display_env: String,
    pub pid: u32,
    pub binary_hash: String,
}

impl AuthRequest {
    /// The OS principal the helper claims to run as.
    pub fn principal(&self) -> String {
        if self.sid.is_empty() {
            self.uid.to_string()
        } else {
            self.sid.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub session_key: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_scopes: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl AuthResponse {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: reason.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    pub can_notify: bool,
    pub can_tray: bool,
    pub can_capture: bool,
    pub can_clipboard: bool,
    pub display_server: String,
}

impl Capabilities {
    /// Capability tags used for session matching.
    pub fn tags(&self) -> Vec<String> {
        [
            (self.can_notify, "notify"),
            (self.can_tray, "tray"),
            (self.can_capture, "capture"),
            (self.can_clipboard, "clipboard"),
        ]
        .into_iter()
        .filter(|(enabled, _)| *enabled)
        .map(|(_, tag)| tag.to_string())
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpcCommand {
    pub command_id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IpcCommandResult {
    pub command_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub result: Value,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotifyRequest {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub icon: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub urgency: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotifyResult {
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_clicked: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrayUpdate {
    pub status: String,
    pub tooltip: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub menu_items: Vec<MenuItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MenuItem {
    pub id: String,
    pub label: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrayAction {
    pub menu_item_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DesktopStartRequest {
    pub session_id: String,
    pub offer: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub ice_servers: Value,
    pub display_index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DesktopStartResponse {
    pub session_id: String,
    pub answer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DesktopStopRequest {
    pub session_id: String,
}
