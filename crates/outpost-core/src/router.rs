//! Per-command decision between local execution and forwarding to a user helper.
//!
//! A routed command either runs in-process, or is sent to a helper session that
//! advertises the needed capability. When no such session exists the route's
//! miss policy decides: run locally, fail, or launch a helper and wait for it
//! to connect. Replies are flattened into the same [`CommandResult`] shape a
//! local handler would produce.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use outpost_traits::{AgentError, Command, CommandResult, CommandStatus};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::{HelperSession, SessionBroker, TargetHint};
use crate::ipc::{Envelope, IpcCommand, IpcCommandResult, MessageType};
use crate::spawner::HelperSpawner;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Running without an interactive desktop (service mode).
    pub detached: bool,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    /// Generic forwarded calls.
    pub forward_timeout: Duration,
    /// Screenshots, input injection, and desktop start.
    pub capture_timeout: Duration,
    /// Added to a script's own timeout when forwarded.
    pub script_grace: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            detached: false,
            poll_interval: Duration::from_millis(500),
            poll_attempts: 10,
            forward_timeout: Duration::from_secs(10),
            capture_timeout: Duration::from_secs(30),
            script_grace: Duration::from_secs(5),
        }
    }
}

impl RouterConfig {
    /// How long to wait for a spawned helper to register.
    pub fn spawn_budget(&self) -> Duration {
        self.poll_interval * self.poll_attempts
    }
}

/// What to do when no matching session is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissPolicy {
    Spawn,
    Local,
    Fail,
}

/// How the helper's reply maps onto a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// `command_result` carrying an [`IpcCommandResult`] whose `result` is a command result.
    Nested,
    /// The reply payload is the data itself.
    Direct,
}

/// Routing progress, reported in debug traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Local,
    Searching,
    Found,
    Spawning,
    SpawnFailed,
    SpawnTimeout,
    Forwarding,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Route {
    pub command_type: String,
    pub request_id: String,
    /// Required session capability; `None` matches any session in the target.
    pub capability: Option<&'static str>,
    /// Scope the session must hold before anything is sent.
    pub scope: Option<&'static str>,
    pub target: TargetHint,
    pub on_miss: MissPolicy,
    /// Route only when the agent is detached from the desktop.
    pub detached_only: bool,
    pub timeout: Duration,
    pub message: MessageType,
    pub payload: Value,
    pub reply: ReplyShape,
}

impl Route {
    /// Forward `command` as an IPC `command` message with a nested reply.
    pub fn command(command: &Command, timeout: Duration) -> Self {
        let request_id = format!(
            "{}-{}",
            command.command_type,
            uuid::Uuid::new_v4().simple()
        );
        let payload = IpcCommand {
            command_id: request_id.clone(),
            command_type: command.command_type.clone(),
            payload: Value::Object(command.payload.clone()),
        };
        Self {
            command_type: command.command_type.clone(),
            request_id,
            capability: None,
            scope: None,
            target: TargetHint::Any,
            on_miss: MissPolicy::Local,
            detached_only: true,
            timeout,
            message: MessageType::Command,
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            reply: ReplyShape::Nested,
        }
    }

    /// Send a typed message whose reply payload is returned as-is.
    pub fn message(
        command_type: &str,
        request_id: impl Into<String>,
        message: MessageType,
        payload: Value,
        timeout: Duration,
    ) -> Self {
        Self {
            command_type: command_type.to_string(),
            request_id: request_id.into(),
            capability: None,
            scope: None,
            target: TargetHint::Any,
            on_miss: MissPolicy::Local,
            detached_only: true,
            timeout,
            message,
            payload,
            reply: ReplyShape::Direct,
        }
    }

    pub fn capability(mut self, capability: &'static str) -> Self {
        self.capability = Some(capability);
        self
    }

    pub fn scope(mut self, scope: &'static str) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn target(mut self, target: TargetHint) -> Self {
        self.target = target;
        self
    }

    pub fn on_miss(mut self, policy: MissPolicy) -> Self {
        self.on_miss = policy;
        self
    }

    pub fn detached_only(mut self, detached_only: bool) -> Self {
        self.detached_only = detached_only;
        self
    }
}

pub struct ExecutionRouter {
    config: RouterConfig,
    broker: Option<Arc<SessionBroker>>,
    spawner: Option<Arc<HelperSpawner>>,
    spawn_guards: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ExecutionRouter {
    pub fn new(
        config: RouterConfig,
        broker: Option<Arc<SessionBroker>>,
        spawner: Option<Arc<HelperSpawner>>,
    ) -> Self {
        Self {
            config,
            broker,
            spawner,
            spawn_guards: DashMap::new(),
        }
    }

    /// Router that always executes locally.
    pub fn local_only() -> Self {
        Self::new(RouterConfig::default(), None, None)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn broker(&self) -> Option<&Arc<SessionBroker>> {
        self.broker.as_ref()
    }

    pub fn spawner(&self) -> Option<&Arc<HelperSpawner>> {
        self.spawner.as_ref()
    }

    /// Run `route` through a helper session, or `local` when routing does not apply.
    pub async fn execute<F, Fut>(&self, route: Route, local: F) -> CommandResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CommandResult>,
    {
        let started = Instant::now();

        let broker = match &self.broker {
            Some(broker) if self.config.detached || !route.detached_only => broker,
            _ => {
                trace_state(&route, RouteState::Local);
                return local().await;
            }
        };

        trace_state(&route, RouteState::Searching);
        let session = match find(broker, &route) {
            Some(session) => session,
            None => match route.on_miss {
                MissPolicy::Local => {
                    trace_state(&route, RouteState::Local);
                    return local().await;
                }
                MissPolicy::Fail => {
                    trace_state(&route, RouteState::Failed);
                    return CommandResult::from_error(
                        &AgentError::Unavailable("no user helper connected".to_string()),
                        elapsed_ms(started),
                    );
                }
                MissPolicy::Spawn => match self.spawn_and_wait(broker, &route).await {
                    Ok(session) => session,
                    Err(err) => {
                        trace_state(&route, RouteState::Failed);
                        return CommandResult::from_error(&err, elapsed_ms(started));
                    }
                },
            },
        };

        trace_state(&route, RouteState::Found);
        let mut result = self.forward(&session, &route).await;
        result.duration_ms = elapsed_ms(started);
        trace_state(
            &route,
            if result.is_success() {
                RouteState::Completed
            } else {
                RouteState::Failed
            },
        );
        result
    }

    /// Send directly to `session`, enforcing the route's scope.
    pub async fn forward(&self, session: &Arc<HelperSession>, route: &Route) -> CommandResult {
        let started = Instant::now();

        if let Some(scope) = route.scope
            && !session.has_scope(scope)
        {
            warn!(
                identity = %session.identity(),
                scope,
                command = %route.command_type,
                "Helper lacks required scope"
            );
            return CommandResult::from_error(
                &AgentError::Authorization(scope.to_string()),
                elapsed_ms(started),
            );
        }

        trace_state(route, RouteState::Forwarding);
        let reply = session
            .send_command(&route.request_id, route.message, &route.payload, route.timeout)
            .await;

        let mut result = match reply {
            Ok(env) => unwrap_reply(route.reply, &env),
            Err(err) => {
                let err = AgentError::from(err);
                if err.is_transient() {
                    warn!(identity = %session.identity(), error = %err, "Helper request failed");
                }
                CommandResult::failed(format!("IPC {} failed: {err}", route.command_type), 0)
            }
        };
        result.duration_ms = elapsed_ms(started);
        result
    }

    async fn spawn_and_wait(
        &self,
        broker: &Arc<SessionBroker>,
        route: &Route,
    ) -> Result<Arc<HelperSession>, AgentError> {
        let spawn_failed = |reason: String| {
            AgentError::Unavailable(format!(
                "no user helper available for {} (spawn failed: {reason})",
                route.command_type
            ))
        };
        let Some(spawner) = &self.spawner else {
            trace_state(route, RouteState::SpawnFailed);
            return Err(spawn_failed("helper spawning not configured".to_string()));
        };

        let key = route.target.spawn_key();
        let guard = self.spawn_guards.entry(key.clone()).or_default().clone();
        // Runs after `_held` is released. The map and this call hold two
        // references; anything more means another caller is queued.
        scopeguard::defer! {
            self.spawn_guards
                .remove_if(&key, |_, held| Arc::ptr_eq(held, &guard) && Arc::strong_count(held) == 2);
        }
        let _held = guard.lock().await;

        // Another caller may have spawned for this target while we waited.
        if let Some(session) = find(broker, route) {
            return Ok(session);
        }

        trace_state(route, RouteState::Spawning);
        if let Err(err) = spawner.spawn_for_target(&route.target).await {
            trace_state(route, RouteState::SpawnFailed);
            return Err(spawn_failed(format!("{err:#}")));
        }

        let budget = self.config.spawn_budget();
        match broker
            .wait_for(|b| find(b, route), budget, self.config.poll_interval)
            .await
        {
            Some(session) => Ok(session),
            None => {
                trace_state(route, RouteState::SpawnTimeout);
                Err(AgentError::Timeout(format!(
                    "helper spawned but did not connect within {}s for {}",
                    budget.as_secs(),
                    route.command_type
                )))
            }
        }
    }
}

fn find(broker: &SessionBroker, route: &Route) -> Option<Arc<HelperSession>> {
    match route.capability {
        Some(capability) => broker.find_capable_session(capability, &route.target),
        None => broker.find_session(&route.target),
    }
}

fn trace_state(route: &Route, state: RouteState) {
    debug!(
        command = %route.command_type,
        request = %route.request_id,
        state = ?state,
        "Route state"
    );
}

fn elapsed_ms(started: Instant) -> u64 {
    (started.elapsed().as_millis() as u64).max(1)
}

/// Flatten a helper reply into a command result.
pub fn unwrap_reply(shape: ReplyShape, env: &Envelope) -> CommandResult {
    if !env.error.is_empty() {
        return CommandResult::failed(env.error.clone(), 0);
    }

    match shape {
        ReplyShape::Direct => CommandResult {
            status: CommandStatus::Completed,
            stdout: if env.payload.is_null() {
                String::new()
            } else {
                env.payload.to_string()
            },
            ..Default::default()
        },
        ReplyShape::Nested => {
            let reply: IpcCommandResult = match env.decode() {
                Ok(reply) => reply,
                Err(err) => {
                    return CommandResult::failed(format!("invalid helper result: {err}"), 0);
                }
            };

            let mut result = match reply.result {
                Value::Null => CommandResult::default(),
                Value::Object(_) => serde_json::from_value::<CommandResult>(reply.result.clone())
                    .unwrap_or_else(|_| CommandResult {
                        stdout: reply.result.to_string(),
                        ..Default::default()
                    }),
                Value::String(ref text) => CommandResult {
                    stdout: text.clone(),
                    ..Default::default()
                },
                ref other => CommandResult {
                    stdout: other.to_string(),
                    ..Default::default()
                },
            };

            let status = CommandStatus::parse(&reply.status);
            if status != CommandStatus::Completed {
                result.status = status;
                if result.exit_code == 0 {
                    result.exit_code = 1;
                }
                if !reply.error.is_empty() {
                    result.error = reply.error;
                }
            }
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(payload: Value) -> Envelope {
        Envelope::new("r-1", MessageType::CommandResult, &payload).unwrap()
    }

    #[test]
    fn test_unwrap_nested_completed() {
        let env = reply(json!({
            "commandId": "r-1",
            "status": "completed",
            "result": {"stdout": "{\"width\":1920}", "exitCode": 0}
        }));
        let result = unwrap_reply(ReplyShape::Nested, &env);
        assert!(result.is_success());
        assert_eq!(result.stdout, "{\"width\":1920}");
    }

    #[test]
    fn test_unwrap_nested_failure_keeps_output() {
        let env = reply(json!({
            "commandId": "r-1",
            "status": "failed",
            "error": "exit status 2",
            "result": {"stdout": "partial", "stderr": "oops", "exitCode": 2}
        }));
        let result = unwrap_reply(ReplyShape::Nested, &env);
        assert_eq!(result.status, CommandStatus::Failed);
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.stdout, "partial");
        assert_eq!(result.stderr, "oops");
        assert_eq!(result.error, "exit status 2");
    }

    #[test]
    fn test_unwrap_envelope_error() {
        let env = Envelope::empty("r-1", MessageType::CommandResult).with_error("capture denied");
        let result = unwrap_reply(ReplyShape::Nested, &env);
        assert_eq!(result.status, CommandStatus::Failed);
        assert_eq!(result.error, "capture denied");
    }

    #[test]
    fn test_unwrap_direct_payload() {
        let env = Envelope::new(
            "d-1",
            MessageType::DesktopStart,
            &json!({"sessionId": "s", "answer": "sdp"}),
        )
        .unwrap();
        let result = unwrap_reply(ReplyShape::Direct, &env);
        assert!(result.is_success());
        let value: Value = serde_json::from_str(&result.stdout).unwrap();
        assert_eq!(value["answer"], "sdp");
    }

    #[test]
    fn test_unwrap_non_object_result() {
        let env = reply(json!({"commandId": "r-1", "status": "completed", "result": [1, 2]}));
        let result = unwrap_reply(ReplyShape::Nested, &env);
        assert_eq!(result.stdout, "[1,2]");
    }

    #[test]
    fn test_spawn_budget() {
        assert_eq!(RouterConfig::default().spawn_budget(), Duration::from_secs(5));
    }

    #[test]
    fn test_command_route_wraps_payload() {
        let cmd = Command::new("c-1", "take_screenshot").with_payload(json!({"monitor": 1}));
        let route = Route::command(&cmd, Duration::from_secs(30)).capability("capture");
        assert!(route.request_id.starts_with("take_screenshot-"));
        assert_eq!(route.payload["type"], "take_screenshot");
        assert_eq!(route.payload["payload"]["monitor"], 1);
        assert_eq!(route.payload["commandId"], route.request_id.as_str());
    }

    #[tokio::test]
    async fn test_spawn_guards_released_after_use() {
        use crate::testing::{StaticDetector, TestLauncher, interactive_session};

        let detector = StaticDetector(vec![
            interactive_session("2", 1000, "alice"),
            interactive_session("3", 1001, "bob"),
        ]);
        let spawner = HelperSpawner::new(
            Arc::new(detector),
            Arc::new(TestLauncher::failing("no display")),
        );
        let router = Arc::new(ExecutionRouter::new(
            RouterConfig {
                detached: true,
                ..Default::default()
            },
            Some(Arc::new(SessionBroker::new())),
            Some(Arc::new(spawner)),
        ));

        let mut calls = tokio::task::JoinSet::new();
        for user in ["alice", "alice", "bob"] {
            let router = router.clone();
            calls.spawn(async move {
                let cmd = Command::new("c-1", "take_screenshot");
                let route = Route::command(&cmd, Duration::from_secs(5))
                    .capability("capture")
                    .target(TargetHint::User(user.into()))
                    .on_miss(MissPolicy::Spawn);
                router
                    .execute(route, || async { CommandResult::failed("local", 0) })
                    .await
            });
        }
        while let Some(result) = calls.join_next().await {
            assert!(result.unwrap().error.contains("spawn failed"));
        }
        assert!(router.spawn_guards.is_empty());
    }
}
