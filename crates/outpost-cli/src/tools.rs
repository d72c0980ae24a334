//! Minimal OS tools for the standalone service.

use std::time::Instant;

use async_trait::async_trait;
use outpost_traits::{AgentError, Command, CommandResult, SystemTools};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessInfo {
    pid: u32,
    name: String,
    state: String,
    cmdline: String,
}

/// Process tools backed by `/proc`; every other tool reports unsupported.
#[derive(Debug, Default)]
pub struct BasicSystemTools;

#[async_trait]
impl SystemTools for BasicSystemTools {
    async fn run(&self, command: &Command) -> CommandResult {
        let started = Instant::now();
        let result = match command.command_type.as_str() {
            "list_processes" => list_processes().map(|procs| {
                CommandResult::success(&serde_json::json!({"processes": procs}), 0)
            }),
            "get_process" => get_process(command).map(|info| CommandResult::success(&info, 0)),
            "kill_process" => kill_process(command),
            other => Err(AgentError::Unavailable(format!(
                "{other} not supported on this platform"
            ))),
        };

        let mut result = result.unwrap_or_else(|err| CommandResult::from_error(&err, 0));
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }
}

fn list_processes() -> Result<Vec<ProcessInfo>, AgentError> {
    let entries = std::fs::read_dir("/proc")
        .map_err(|err| AgentError::Unavailable(format!("read /proc: {err}")))?;
    let mut procs: Vec<ProcessInfo> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter_map(read_process)
        .collect();
    procs.sort_by_key(|p| p.pid);
    Ok(procs)
}

fn get_process(command: &Command) -> Result<ProcessInfo, AgentError> {
    let pid = command
        .get_i64("pid")
        .and_then(|pid| u32::try_from(pid).ok())
        .ok_or_else(|| AgentError::missing_field("pid"))?;
    read_process(pid).ok_or_else(|| AgentError::Validation(format!("process {pid} not found")))
}

fn read_process(pid: u32) -> Option<ProcessInfo> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let field = |name: &str| {
        status
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .map(|value| value.trim_start_matches(':').trim().to_string())
            .unwrap_or_default()
    };
    let cmdline = std::fs::read(format!("/proc/{pid}/cmdline"))
        .map(|raw| {
            String::from_utf8_lossy(&raw)
                .split('\0')
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();

    Some(ProcessInfo {
        pid,
        name: field("Name"),
        state: field("State"),
        cmdline,
    })
}

#[cfg(unix)]
fn kill_process(command: &Command) -> Result<CommandResult, AgentError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = command
        .get_i64("pid")
        .and_then(|pid| i32::try_from(pid).ok())
        .filter(|pid| *pid > 0)
        .ok_or_else(|| AgentError::missing_field("pid"))?;
    let signal = if command.get_bool("force") {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };
    kill(Pid::from_raw(pid), signal)
        .map_err(|err| AgentError::Validation(format!("kill {pid}: {err}")))?;
    Ok(CommandResult::success(
        &serde_json::json!({"pid": pid, "signal": signal.as_str()}),
        0,
    ))
}

#[cfg(not(unix))]
fn kill_process(_command: &Command) -> Result<CommandResult, AgentError> {
    Err(AgentError::Unavailable(
        "kill_process not supported on this platform".to_string(),
    ))
}
