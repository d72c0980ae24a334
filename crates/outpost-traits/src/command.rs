//! Inbound commands and the uniform result every handler produces.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AgentError;

/// A command received from the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Command {
    pub fn new(id: impl Into<String>, command_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command_type: command_type.into(),
            payload: Map::new(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        if let Value::Object(map) = payload {
            self.payload = map;
        }
        self
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Non-empty string field or a validation error naming the field.
    pub fn require_str(&self, key: &str) -> Result<&str, AgentError> {
        match self.get_str(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(AgentError::missing_field(key)),
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.payload.get(key).and_then(|v| match v {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.payload
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    #[default]
    Completed,
    Failed,
    Timeout,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Timeout => "timeout",
        }
    }

    /// Lenient parse used when unwrapping helper replies. Unrecognized values count as failures.
    pub fn parse(value: &str) -> Self {
        match value {
            "completed" => CommandStatus::Completed,
            "timeout" => CommandStatus::Timeout,
            _ => CommandStatus::Failed,
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

/// Result of executing a command, reported back to the control plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandResult {
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "is_zero")]
    pub exit_code: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub duration_ms: u64,
}

impl CommandResult {
    /// Completed result with `data` serialized as JSON into stdout.
    pub fn success<T: Serialize>(data: &T, duration_ms: u64) -> Self {
        match serde_json::to_string(data) {
            Ok(stdout) => Self {
                status: CommandStatus::Completed,
                stdout,
                duration_ms,
                ..Default::default()
            },
            Err(err) => Self::failed(format!("failed to encode result: {err}"), duration_ms),
        }
    }

    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: CommandStatus::Failed,
            exit_code: 1,
            error: error.into(),
            duration_ms,
            ..Default::default()
        }
    }

    pub fn from_error(err: &AgentError, duration_ms: u64) -> Self {
        Self::failed(err.to_string(), duration_ms)
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Completed
    }
}
