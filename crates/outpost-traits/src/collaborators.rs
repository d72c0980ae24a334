//! Collaborators the agent consumes but does not implement here: OS tools and script execution.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::{Command, CommandResult};
use crate::error::Result;

pub const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 300;

/// OS-specific tool implementations (processes, services, files, registry, ...).
#[async_trait]
pub trait SystemTools: Send + Sync {
    async fn run(&self, command: &Command) -> CommandResult;
}

/// A script to execute, as carried in `script` / `run_script` payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptExecution {
    pub id: String,
    pub script_id: String,
    pub language: String,
    pub content: String,
    pub timeout_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_as: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, String>,
}

impl ScriptExecution {
    pub fn from_command(command: &Command) -> Self {
        let parameters = command
            .payload
            .get("parameters")
            .and_then(Value::as_object)
            .map(|params| {
                params
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            id: command.id.clone(),
            script_id: command.get_str("scriptId").unwrap_or_default().to_string(),
            language: command.get_str("language").unwrap_or("bash").to_string(),
            content: command.get_str("content").unwrap_or_default().to_string(),
            timeout_seconds: command
                .get_i64("timeoutSeconds")
                .filter(|t| *t > 0)
                .map(|t| t as u64)
                .unwrap_or(DEFAULT_SCRIPT_TIMEOUT_SECS),
            run_as: command
                .get_str("runAs")
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            parameters,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptOutput {
    pub execution_id: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timed_out: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningScript {
    pub execution_id: String,
    pub language: String,
    pub started_at: DateTime<Utc>,
}

#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    async fn execute(&self, script: ScriptExecution) -> Result<ScriptOutput>;

    /// Terminate a running execution. Errors when the id is unknown or already finished.
    async fn cancel(&self, execution_id: &str) -> Result<()>;

    fn list_running(&self) -> Vec<RunningScript>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_script_execution_from_payload() {
        let cmd = Command::new("exec-1", "script").with_payload(json!({
            "content": "echo hi",
            "timeoutSeconds": 12,
            "runAs": "alice",
            "parameters": {"name": "x", "ignored": 3}
        }));
        let script = ScriptExecution::from_command(&cmd);
        assert_eq!(script.id, "exec-1");
        assert_eq!(script.language, "bash");
        assert_eq!(script.timeout_seconds, 12);
        assert_eq!(script.run_as.as_deref(), Some("alice"));
        assert_eq!(script.parameters.len(), 1);
    }

    #[test]
    fn test_script_execution_defaults() {
        let script = ScriptExecution::from_command(&Command::new("e", "script"));
        assert_eq!(script.timeout_seconds, DEFAULT_SCRIPT_TIMEOUT_SECS);
        assert!(script.run_as.is_none());
    }
}
