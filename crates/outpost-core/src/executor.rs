//! Local script execution
//!
//! Runs script content through the interpreter for its language with:
//! - A per-execution timeout (default 300s)
//! - Cancel-by-id for running executions
//! - Output capped at 1 MiB per stream, NUL bytes stripped
//! - Parameters exported as `OUTPOST_PARAM_<NAME>` environment variables

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use outpost_traits::{
    AgentError, AgentResult, DEFAULT_SCRIPT_TIMEOUT_SECS, RunningScript, ScriptExecution,
    ScriptExecutor, ScriptOutput,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Maximum captured size per output stream (1 MiB)
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Upper bound on a requested timeout (24h)
const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// How long output readers may run once the script has ended.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

struct RunningEntry {
    language: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

enum Ending {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// [`ScriptExecutor`] backed by local interpreters.
#[derive(Clone)]
pub struct ShellScriptExecutor {
    max_output_bytes: usize,
    running: Arc<DashMap<String, RunningEntry>>,
}

impl Default for ShellScriptExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellScriptExecutor {
    pub fn new() -> Self {
        Self {
            max_output_bytes: MAX_OUTPUT_BYTES,
            running: Arc::new(DashMap::new()),
        }
    }

    /// Set maximum captured bytes per stream
    pub fn with_max_output(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    fn build_command(&self, script: &ScriptExecution) -> AgentResult<Command> {
        let (program, args) = interpreter(&script.language).ok_or_else(|| {
            AgentError::Validation(format!("unsupported script type: {}", script.language))
        })?;

        let mut cmd = match script.run_as.as_deref() {
            Some(user) if !is_current_user(user) => {
                let mut sudo = Command::new("sudo");
                sudo.arg("-n");
                if user != "root" {
                    sudo.arg("-u").arg(user);
                }
                sudo.arg(program);
                sudo
            }
            _ => Command::new(program),
        };
        cmd.args(args).arg(&script.content);

        cmd.env("OUTPOST_EXECUTION_ID", &script.id);
        cmd.env("OUTPOST_SCRIPT_ID", &script.script_id);
        for (key, value) in &script.parameters {
            cmd.env(param_env_name(key), value);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        Ok(cmd)
    }

    fn sanitize(&self, bytes: Vec<u8>, truncated: bool) -> String {
        let mut text = String::from_utf8_lossy(&bytes).replace('\0', "");
        if truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

fn interpreter(language: &str) -> Option<(&'static str, &'static [&'static str])> {
    match language {
        "bash" | "" => Some(("bash", &["-c"])),
        "sh" | "shell" => Some(("sh", &["-c"])),
        "python" | "python3" => Some(("python3", &["-c"])),
        "powershell" | "pwsh" => Some(("pwsh", &["-NoProfile", "-NonInteractive", "-Command"])),
        _ => None,
    }
}

fn param_env_name(key: &str) -> String {
    format!("OUTPOST_PARAM_{}", key.replace('-', "_").to_uppercase())
}

#[cfg(unix)]
fn is_current_user(name: &str) -> bool {
    nix::unistd::User::from_uid(nix::unistd::geteuid())
        .ok()
        .flatten()
        .is_some_and(|user| user.name == name)
}

#[cfg(not(unix))]
fn is_current_user(_name: &str) -> bool {
    true
}

/// Read a stream to the end, keeping at most `limit` bytes.
async fn read_limited<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> (Vec<u8>, bool) {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    (kept, truncated)
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(err) => warn!(pid, error = %err, "Failed to kill script process group"),
    }
}

/// Collect a reader task, giving up once `until` passes. A process that left
/// the group can keep a pipe open indefinitely.
async fn join_output(task: JoinHandle<(Vec<u8>, bool)>, until: Instant) -> (Vec<u8>, bool) {
    let abort = task.abort_handle();
    match tokio::time::timeout_at(until, task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            abort.abort();
            warn!("Script output still open after exit, discarding");
            (Vec::new(), false)
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[async_trait]
impl ScriptExecutor for ShellScriptExecutor {
    async fn execute(&self, script: ScriptExecution) -> AgentResult<ScriptOutput> {
        let started_at = Utc::now();
        let timeout_secs = match script.timeout_seconds {
            0 => DEFAULT_SCRIPT_TIMEOUT_SECS,
            secs => secs.min(MAX_TIMEOUT_SECS),
        };

        let mut cmd = self.build_command(&script)?;
        let mut child = cmd.spawn().map_err(|err| {
            AgentError::Other(anyhow::anyhow!("failed to start {}: {err}", script.language))
        })?;
        let pid = child.id();

        info!(
            execution_id = %script.id,
            language = %script.language,
            timeout_secs,
            "Script started"
        );

        let cancel = CancellationToken::new();
        self.running.insert(
            script.id.clone(),
            RunningEntry {
                language: script.language.clone(),
                started_at,
                cancel: cancel.clone(),
            },
        );
        let running = self.running.clone();
        let execution_id = script.id.clone();
        scopeguard::defer! {
            running.remove(&execution_id);
        }

        let limit = self.max_output_bytes;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            match stdout {
                Some(out) => read_limited(out, limit).await,
                None => (Vec::new(), false),
            }
        });
        let stderr_task = tokio::spawn(async move {
            match stderr {
                Some(err) => read_limited(err, limit).await,
                None => (Vec::new(), false),
            }
        });

        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        let ending = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Ending::Exited(status),
                Err(err) => return Err(AgentError::Other(anyhow::anyhow!("wait for script: {err}"))),
            },
            _ = tokio::time::sleep_until(deadline) => Ending::TimedOut,
            _ = cancel.cancelled() => Ending::Cancelled,
        };

        // Background children of a finished script still hold the pipes.
        kill_process_group(pid);
        if !matches!(ending, Ending::Exited(_))
            && let Err(err) = child.kill().await
        {
            warn!(execution_id = %script.id, error = %err, "Failed to kill script");
        }

        let drain_until = Instant::now() + OUTPUT_DRAIN_GRACE;
        let (stdout, stdout_truncated) = join_output(stdout_task, drain_until).await;
        let (stderr, stderr_truncated) = join_output(stderr_task, drain_until).await;

        let (exit_code, error, timed_out) = match ending {
            Ending::Exited(status) => (status.code().unwrap_or(-1), None, false),
            Ending::TimedOut => {
                warn!(execution_id = %script.id, timeout_secs, "Script timed out");
                (
                    -1,
                    Some(format!("execution timed out after {timeout_secs} seconds")),
                    true,
                )
            }
            Ending::Cancelled => (-1, Some("execution cancelled".to_string()), false),
        };

        info!(execution_id = %script.id, exit_code, "Script finished");
        Ok(ScriptOutput {
            execution_id: script.id,
            exit_code,
            stdout: self.sanitize(stdout, stdout_truncated),
            stderr: self.sanitize(stderr, stderr_truncated),
            error,
            timed_out,
            started_at,
            completed_at: Utc::now(),
        })
    }

    async fn cancel(&self, execution_id: &str) -> AgentResult<()> {
        let entry = self.running.get(execution_id).ok_or_else(|| {
            AgentError::Validation(format!(
                "execution {execution_id} not found or already completed"
            ))
        })?;
        info!(execution_id, "Cancelling script");
        entry.cancel.cancel();
        Ok(())
    }

    fn list_running(&self) -> Vec<RunningScript> {
        let mut running: Vec<RunningScript> = self
            .running
            .iter()
            .map(|entry| RunningScript {
                execution_id: entry.key().clone(),
                language: entry.language.clone(),
                started_at: entry.started_at,
            })
            .collect();
        running.sort_by_key(|r| r.started_at);
        running
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn script(id: &str, content: &str) -> ScriptExecution {
        ScriptExecution {
            id: id.to_string(),
            language: "sh".to_string(),
            content: content.to_string(),
            timeout_seconds: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_runs_script_and_captures_output() {
        let executor = ShellScriptExecutor::new();
        let output = executor
            .execute(script("e1", "echo out; echo err >&2; exit 3"))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn test_parameters_exported() {
        let executor = ShellScriptExecutor::new();
        let mut exec = script("e2", "printf %s \"$OUTPOST_PARAM_TARGET_HOST\"");
        exec.parameters = HashMap::from([("target-host".to_string(), "db1".to_string())]);
        let output = executor.execute(exec).await.unwrap();
        assert_eq!(output.stdout, "db1");
    }

    #[tokio::test]
    async fn test_background_child_does_not_outlive_script() {
        let executor = ShellScriptExecutor::new();
        let mut exec = script("e7", "echo hi; sleep 20 &");
        exec.timeout_seconds = 5;
        let started = std::time::Instant::now();
        let output = executor.execute(exec).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, "hi\n");
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn test_timeout() {
        let executor = ShellScriptExecutor::new();
        let mut exec = script("e3", "sleep 30");
        exec.timeout_seconds = 1;
        let output = executor.execute(exec).await.unwrap();
        assert!(output.timed_out);
        assert_eq!(output.error.as_deref(), Some("execution timed out after 1 seconds"));
        assert!(executor.list_running().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_running_script() {
        let executor = ShellScriptExecutor::new();
        let runner = executor.clone();
        let handle = tokio::spawn(async move { runner.execute(script("e4", "sleep 30")).await });

        for _ in 0..100 {
            if !executor.list_running().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(executor.list_running()[0].execution_id, "e4");
        executor.cancel("e4").await.unwrap();

        let output = handle.await.unwrap().unwrap();
        assert_eq!(output.error.as_deref(), Some("execution cancelled"));
        assert!(executor.cancel("e4").await.is_err());
    }

    #[tokio::test]
    async fn test_output_truncated_and_nul_stripped() {
        let executor = ShellScriptExecutor::new().with_max_output(4);
        let output = executor
            .execute(script("e5", "printf 'a\\0bcdefgh'"))
            .await
            .unwrap();
        assert_eq!(output.stdout, format!("abc{TRUNCATION_MARKER}"));
    }

    #[tokio::test]
    async fn test_unsupported_language() {
        let executor = ShellScriptExecutor::new();
        let mut exec = script("e6", "x");
        exec.language = "cobol".into();
        let err = executor.execute(exec).await.unwrap_err();
        assert_eq!(err.to_string(), "unsupported script type: cobol");
    }
}
