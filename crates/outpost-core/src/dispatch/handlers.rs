//! Command handlers and the single function that assembles the registry.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use outpost_traits::{
    AgentError, Command, CommandHandler, CommandResult, CommandStatus, ScriptExecution,
    ScriptExecutor, SystemTools, handler_fn,
};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::DispatchRegistry;
use crate::broker::TargetHint;
use crate::ipc::{
    DesktopStartRequest, DesktopStartResponse, DesktopStopRequest, MenuItem, MessageType,
    NotifyRequest, NotifyResult, TrayUpdate,
};
use crate::router::{ExecutionRouter, MissPolicy, Route};
use crate::spawner::DetectedSession;

const DEFAULT_NOTIFY_TITLE: &str = "Outpost Agent";

/// OS tool commands passed straight to [`SystemTools`].
pub const LOCAL_TOOL_TYPES: &[&str] = &[
    "list_processes",
    "get_process",
    "kill_process",
    "list_services",
    "get_service",
    "start_service",
    "stop_service",
    "restart_service",
    "event_logs_list",
    "event_logs_query",
    "event_log_get",
    "tasks_list",
    "task_get",
    "task_run",
    "task_enable",
    "task_disable",
    "task_history",
    "registry_keys",
    "registry_values",
    "registry_get",
    "registry_set",
    "registry_delete",
    "registry_key_create",
    "registry_key_delete",
    "reboot",
    "shutdown",
    "lock",
    "collect_software",
    "software_uninstall",
    "file_list",
    "file_read",
    "file_write",
    "file_delete",
    "file_mkdir",
    "file_rename",
    "filesystem_analysis",
    "terminal_start",
    "terminal_data",
    "terminal_resize",
    "terminal_stop",
    "patch_scan",
    "install_patches",
    "rollback_patches",
    "backup_run",
    "backup_list",
    "backup_stop",
];

/// Commands handled by the agent itself: routed, broker-direct, or executor-direct.
pub const AGENT_TYPES: &[&str] = &[
    "take_screenshot",
    "computer_action",
    "start_desktop",
    "stop_desktop",
    "script",
    "run_script",
    "script_cancel",
    "script_list_running",
    "notify_user",
    "tray_update",
    "list_sessions",
];

/// Every command type [`build_registry`] registers.
pub fn registered_types() -> impl Iterator<Item = &'static str> {
    LOCAL_TOOL_TYPES.iter().chain(AGENT_TYPES).copied()
}

/// Everything a handler may call into.
pub struct HandlerContext {
    pub router: Arc<ExecutionRouter>,
    pub tools: Arc<dyn SystemTools>,
    pub executor: Arc<dyn ScriptExecutor>,
}

pub fn build_registry(ctx: HandlerContext) -> DispatchRegistry {
    let ctx = Arc::new(ctx);
    let mut registry = DispatchRegistry::new();

    let passthrough: Arc<dyn CommandHandler> = Arc::new(ToolPassthrough(ctx.tools.clone()));
    for command_type in LOCAL_TOOL_TYPES {
        registry.register(*command_type, passthrough.clone());
    }

    registry.register("take_screenshot", bind(&ctx, handle_capture_tool));
    registry.register("computer_action", bind(&ctx, handle_capture_tool));
    registry.register("start_desktop", bind(&ctx, handle_start_desktop));
    registry.register("stop_desktop", bind(&ctx, handle_stop_desktop));
    registry.register("script", bind(&ctx, handle_script));
    registry.register("run_script", bind(&ctx, handle_script));
    registry.register("script_cancel", bind(&ctx, handle_script_cancel));
    registry.register("script_list_running", bind(&ctx, handle_script_list_running));
    registry.register("notify_user", bind(&ctx, handle_notify_user));
    registry.register("tray_update", bind(&ctx, handle_tray_update));
    registry.register("list_sessions", bind(&ctx, handle_list_sessions));

    registry
}

fn bind<F, Fut>(ctx: &Arc<HandlerContext>, handler: F) -> Arc<dyn CommandHandler>
where
    F: Fn(Arc<HandlerContext>, Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CommandResult> + Send + 'static,
{
    let ctx = ctx.clone();
    handler_fn(move |command| handler(ctx.clone(), command))
}

struct ToolPassthrough(Arc<dyn SystemTools>);

#[async_trait]
impl CommandHandler for ToolPassthrough {
    async fn handle(&self, command: &Command) -> CommandResult {
        self.0.run(command).await
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn invalid(message: impl Into<String>, started: Instant) -> CommandResult {
    CommandResult::from_error(&AgentError::Validation(message.into()), elapsed_ms(started))
}

/// `targetSessionId` may arrive as a number or a string.
fn target_session(command: &Command) -> Option<String> {
    match command.payload.get("targetSessionId")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

// take_screenshot, computer_action

async fn handle_capture_tool(ctx: Arc<HandlerContext>, command: Command) -> CommandResult {
    let route = Route::command(&command, ctx.router.config().capture_timeout)
        .capability("capture")
        .on_miss(MissPolicy::Spawn);
    let tools = ctx.tools.clone();
    ctx.router
        .execute(route, move || async move { tools.run(&command).await })
        .await
}

// start_desktop, stop_desktop

async fn handle_start_desktop(ctx: Arc<HandlerContext>, command: Command) -> CommandResult {
    let started = Instant::now();
    let session_id = command.get_str("sessionId").unwrap_or_default().to_string();
    let offer = command.get_str("offer").unwrap_or_default().to_string();
    if session_id.is_empty() || offer.is_empty() {
        return invalid("missing sessionId or offer", started);
    }

    let request = DesktopStartRequest {
        session_id: session_id.clone(),
        offer,
        ice_servers: command.payload.get("iceServers").cloned().unwrap_or_default(),
        display_index: command
            .get_i64("displayIndex")
            .filter(|index| *index >= 0)
            .unwrap_or(0) as u32,
    };
    let payload = match serde_json::to_value(&request) {
        Ok(payload) => payload,
        Err(err) => return invalid(format!("encode desktop request: {err}"), started),
    };

    let target = TargetHint::os_session(target_session(&command).as_deref());
    let route = Route::message(
        "start_desktop",
        format!("desk-{session_id}"),
        MessageType::DesktopStart,
        payload,
        ctx.router.config().capture_timeout,
    )
    .capability("capture")
    .target(target)
    .on_miss(MissPolicy::Spawn);

    let tools = ctx.tools.clone();
    let result = ctx
        .router
        .execute(route, move || async move { tools.run(&command).await })
        .await;

    if result.is_success()
        && let Ok(response) = serde_json::from_str::<DesktopStartResponse>(&result.stdout)
    {
        return CommandResult::success(
            &json!({"sessionId": session_id, "answer": response.answer}),
            result.duration_ms,
        );
    }
    result
}

async fn handle_stop_desktop(ctx: Arc<HandlerContext>, command: Command) -> CommandResult {
    let started = Instant::now();
    let session_id = match command.require_str("sessionId") {
        Ok(id) => id.to_string(),
        Err(err) => return CommandResult::from_error(&err, elapsed_ms(started)),
    };

    let payload = json!(DesktopStopRequest {
        session_id: session_id.clone()
    });
    let route = Route::message(
        "stop_desktop",
        format!("desk-stop-{session_id}"),
        MessageType::DesktopStop,
        payload,
        ctx.router.config().forward_timeout,
    )
    .capability("capture")
    .on_miss(MissPolicy::Local);

    let tools = ctx.tools.clone();
    let result = ctx
        .router
        .execute(route, move || async move { tools.run(&command).await })
        .await;

    if result.is_success() {
        return CommandResult::success(&json!({"stopped": true}), result.duration_ms);
    }
    result
}

// script, run_script, script_cancel, script_list_running

async fn handle_script(ctx: Arc<HandlerContext>, command: Command) -> CommandResult {
    let started = Instant::now();
    let script = ScriptExecution::from_command(&command);
    if script.content.is_empty() {
        return invalid("script content is empty", started);
    }

    let Some(user) = script.run_as.clone() else {
        return run_local_script(ctx.executor.clone(), script).await;
    };

    let timeout = Duration::from_secs(script.timeout_seconds) + ctx.router.config().script_grace;
    let route = Route::command(&command, timeout)
        .scope("run_as_user")
        .target(TargetHint::User(user.clone()))
        .on_miss(MissPolicy::Local)
        .detached_only(false);

    let executor = ctx.executor.clone();
    let result = ctx
        .router
        .execute(route, move || run_local_script(executor, script))
        .await;
    info!(
        command_id = %command.id,
        run_as = %user,
        status = %result.status,
        "Script executed for user"
    );
    result
}

async fn run_local_script(
    executor: Arc<dyn ScriptExecutor>,
    script: ScriptExecution,
) -> CommandResult {
    let started = Instant::now();
    let output = match executor.execute(script).await {
        Ok(output) => output,
        Err(err) => return CommandResult::from_error(&err, elapsed_ms(started)),
    };

    let error = output.error.unwrap_or_default();
    let status = if output.timed_out || error.contains("timed out") {
        CommandStatus::Timeout
    } else if output.exit_code != 0 {
        CommandStatus::Failed
    } else {
        CommandStatus::Completed
    };

    CommandResult {
        status,
        exit_code: output.exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
        error,
        duration_ms: elapsed_ms(started),
    }
}

async fn handle_script_cancel(ctx: Arc<HandlerContext>, command: Command) -> CommandResult {
    let started = Instant::now();
    let execution_id = match command.require_str("executionId") {
        Ok(id) => id,
        Err(err) => return CommandResult::from_error(&err, elapsed_ms(started)),
    };
    if let Err(err) = ctx.executor.cancel(execution_id).await {
        return CommandResult::from_error(&err, elapsed_ms(started));
    }
    CommandResult::success(
        &json!({"executionId": execution_id, "cancelled": true}),
        elapsed_ms(started),
    )
}

async fn handle_script_list_running(ctx: Arc<HandlerContext>, _command: Command) -> CommandResult {
    let started = Instant::now();
    let running = ctx.executor.list_running();
    CommandResult::success(
        &json!({"count": running.len(), "running": running}),
        elapsed_ms(started),
    )
}

// notify_user, tray_update

async fn handle_notify_user(ctx: Arc<HandlerContext>, command: Command) -> CommandResult {
    let started = Instant::now();
    let Some(broker) = ctx.router.broker() else {
        return CommandResult::failed("user helper not enabled", elapsed_ms(started));
    };

    let body = command.get_str("body").unwrap_or_default();
    if body.is_empty() {
        return invalid("notification body is required", started);
    }

    let username = command.get_str("username").unwrap_or_default();
    let session = if username.is_empty() {
        broker.all_sessions().into_iter().next()
    } else {
        broker.session_for_user(username)
    };
    let Some(session) = session else {
        return CommandResult::from_error(
            &AgentError::Unavailable("no user helper connected".to_string()),
            elapsed_ms(started),
        );
    };

    let request = NotifyRequest {
        title: command
            .get_str("title")
            .unwrap_or(DEFAULT_NOTIFY_TITLE)
            .to_string(),
        body: body.to_string(),
        icon: command.get_str("icon").unwrap_or_default().to_string(),
        urgency: command.get_str("urgency").unwrap_or("normal").to_string(),
        actions: string_list(command.payload.get("actions")),
    };
    let route = Route::message(
        "notify_user",
        command.id.clone(),
        MessageType::Notify,
        json!(request),
        ctx.router.config().forward_timeout,
    )
    .scope("notify");

    let result = ctx.router.forward(&session, &route).await;
    if !result.is_success() {
        return result;
    }

    let reply: NotifyResult = serde_json::from_str(&result.stdout).unwrap_or_else(|err| {
        warn!(error = %err, "Unreadable notify result");
        NotifyResult::default()
    });
    let identity = session.identity();
    CommandResult::success(
        &json!({
            "delivered": reply.delivered,
            "actionClicked": reply.action_clicked,
            "uid": identity.principal,
            "username": identity.username,
        }),
        elapsed_ms(started),
    )
}

async fn handle_tray_update(ctx: Arc<HandlerContext>, command: Command) -> CommandResult {
    let started = Instant::now();
    let Some(broker) = ctx.router.broker() else {
        return CommandResult::failed("user helper not enabled", elapsed_ms(started));
    };

    let menu_items = command
        .payload
        .get("menuItems")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_object)
                .map(|item| MenuItem {
                    id: item.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                    label: item
                        .get("label")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    enabled: item.get("enabled").and_then(Value::as_bool).unwrap_or(true),
                })
                .collect()
        })
        .unwrap_or_default();

    let update = TrayUpdate {
        status: command.get_str("status").unwrap_or("ok").to_string(),
        tooltip: command
            .get_str("tooltip")
            .unwrap_or(DEFAULT_NOTIFY_TITLE)
            .to_string(),
        menu_items,
    };
    let sent = broker.broadcast(MessageType::TrayUpdate, &update).await;
    CommandResult::success(&json!({"sentTo": sent}), elapsed_ms(started))
}

// list_sessions

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionListing {
    #[serde(flatten)]
    session: DetectedSession,
    helper_connected: bool,
}

async fn handle_list_sessions(ctx: Arc<HandlerContext>, _command: Command) -> CommandResult {
    let started = Instant::now();
    let Some(spawner) = ctx.router.spawner() else {
        return CommandResult::failed("session detection not available", elapsed_ms(started));
    };

    let detected = match spawner.list_sessions().await {
        Ok(sessions) => sessions,
        Err(err) => return CommandResult::failed(format!("{err:#}"), elapsed_ms(started)),
    };

    let connected: HashSet<String> = ctx
        .router
        .broker()
        .map(|broker| {
            broker
                .all_sessions()
                .iter()
                .map(|s| s.identity().os_session.clone())
                .collect()
        })
        .unwrap_or_default();

    let sessions: Vec<SessionListing> = detected
        .into_iter()
        .map(|session| SessionListing {
            helper_connected: connected.contains(&session.session),
            session,
        })
        .collect();
    CommandResult::success(&json!({"sessions": sessions}), elapsed_ms(started))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingTools, StubExecutor};

    fn context(executor: StubExecutor) -> (HandlerContext, Arc<RecordingTools>, Arc<StubExecutor>) {
        let tools = Arc::new(RecordingTools::default());
        let executor = Arc::new(executor);
        (
            HandlerContext {
                router: Arc::new(ExecutionRouter::local_only()),
                tools: tools.clone(),
                executor: executor.clone(),
            },
            tools,
            executor,
        )
    }

    #[tokio::test]
    async fn test_every_registered_type_dispatches() {
        let (ctx, _, _) = context(StubExecutor::default());
        let registry = build_registry(ctx);

        let mut expected: Vec<&str> = registered_types().collect();
        expected.sort_unstable();
        assert_eq!(registry.list(), expected);

        for command_type in registered_types() {
            let (result, found) = registry
                .dispatch(&Command::new("c-1", command_type))
                .await;
            assert!(found, "{command_type} not registered");
            assert!(result.duration_ms > 0, "{command_type} has no duration");
        }
    }

    #[tokio::test]
    async fn test_tool_passthrough() {
        let (ctx, tools, _) = context(StubExecutor::default());
        let registry = build_registry(ctx);
        let (result, _) = registry.dispatch(&Command::new("c-1", "list_processes")).await;
        assert!(result.is_success());
        assert_eq!(tools.calls(), vec!["list_processes"]);
    }

    #[tokio::test]
    async fn test_screenshot_runs_locally_without_broker() {
        let (ctx, tools, _) = context(StubExecutor::default());
        let registry = build_registry(ctx);
        let (result, _) = registry.dispatch(&Command::new("c-1", "take_screenshot")).await;
        assert!(result.is_success());
        assert_eq!(tools.calls(), vec!["take_screenshot"]);
    }

    #[tokio::test]
    async fn test_empty_script_rejected() {
        let (ctx, _, executor) = context(StubExecutor::default());
        let registry = build_registry(ctx);
        let (result, _) = registry.dispatch(&Command::new("c-1", "script")).await;
        assert_eq!(result.status, CommandStatus::Failed);
        assert_eq!(result.error, "script content is empty");
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn test_run_as_without_broker_runs_locally() {
        let (ctx, _, executor) = context(StubExecutor::with_output(0, "hi\n", None));
        let registry = build_registry(ctx);
        let cmd = Command::new("c-1", "run_script")
            .with_payload(json!({"content": "echo hi", "runAs": "alice"}));
        let (result, _) = registry.dispatch(&cmd).await;
        assert!(result.is_success());
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(executor.executed()[0].run_as.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_script_status_mapping() {
        let (ctx, _, _) = context(StubExecutor::with_output(124, "", Some("script timed out after 5s")));
        let registry = build_registry(ctx);
        let cmd = Command::new("c-1", "script").with_payload(json!({"content": "sleep 9"}));
        let (result, _) = registry.dispatch(&cmd).await;
        assert_eq!(result.status, CommandStatus::Timeout);
        assert_eq!(result.exit_code, 124);

        let (ctx, _, _) = context(StubExecutor::with_output(2, "", None));
        let (result, _) = build_registry(ctx).dispatch(&cmd).await;
        assert_eq!(result.status, CommandStatus::Failed);
    }

    #[tokio::test]
    async fn test_script_cancel_requires_execution_id() {
        let (ctx, _, _) = context(StubExecutor::default());
        let registry = build_registry(ctx);
        let (result, _) = registry.dispatch(&Command::new("c-1", "script_cancel")).await;
        assert_eq!(result.error, "executionId is required");
    }

    #[tokio::test]
    async fn test_helper_commands_need_broker() {
        let (ctx, _, _) = context(StubExecutor::default());
        let registry = build_registry(ctx);
        let cmd = Command::new("c-1", "notify_user").with_payload(json!({"body": "hello"}));
        let (result, _) = registry.dispatch(&cmd).await;
        assert_eq!(result.error, "user helper not enabled");
        let (result, _) = registry.dispatch(&Command::new("c-2", "tray_update")).await;
        assert_eq!(result.error, "user helper not enabled");
    }

    #[tokio::test]
    async fn test_start_desktop_requires_offer() {
        let (ctx, tools, _) = context(StubExecutor::default());
        let registry = build_registry(ctx);
        let cmd = Command::new("c-1", "start_desktop").with_payload(json!({"sessionId": "s1"}));
        let (result, _) = registry.dispatch(&cmd).await;
        assert_eq!(result.error, "missing sessionId or offer");
        assert!(tools.calls().is_empty());
    }

    #[test]
    fn test_target_session_accepts_numbers() {
        let cmd = Command::new("c", "start_desktop").with_payload(json!({"targetSessionId": 3}));
        assert_eq!(target_session(&cmd).as_deref(), Some("3"));
        let cmd = Command::new("c", "start_desktop").with_payload(json!({"targetSessionId": ""}));
        assert_eq!(target_session(&cmd), None);
    }
}
