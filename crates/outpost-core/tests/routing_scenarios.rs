use std::sync::Arc;
use std::sync::atomic::Ordering;

use outpost_core::broker::listener::DEFAULT_SCOPES;
use outpost_core::dispatch::{DispatchRegistry, HandlerContext, build_registry};
use outpost_core::ipc::{Envelope, IpcCommandResult, MessageType};
use outpost_core::testing::{
    RecordingTools, StaticDetector, StubExecutor, TestLauncher, attach_fake_helper,
    interactive_session,
};
use outpost_core::{ExecutionRouter, HelperSpawner, RouterConfig, SessionBroker, SessionIdentity};
use outpost_traits::{Command, CommandStatus};
use serde_json::json;

struct Agent {
    registry: DispatchRegistry,
    tools: Arc<RecordingTools>,
    executor: Arc<StubExecutor>,
}

fn agent(
    detached: bool,
    broker: Option<Arc<SessionBroker>>,
    launcher: Option<TestLauncher>,
) -> (Agent, Option<Arc<TestLauncher>>) {
    let launcher = launcher.map(Arc::new);
    let spawner = launcher.clone().map(|launcher| {
        let detector = StaticDetector(vec![interactive_session("2", 1000, "alice")]);
        Arc::new(HelperSpawner::new(Arc::new(detector), launcher))
    });
    let config = RouterConfig {
        detached,
        ..Default::default()
    };
    let router = Arc::new(ExecutionRouter::new(config, broker, spawner));
    let tools = Arc::new(RecordingTools::default());
    let executor = Arc::new(StubExecutor::with_output(0, "local\n", None));
    let registry = build_registry(HandlerContext {
        router,
        tools: tools.clone(),
        executor: executor.clone(),
    });
    (
        Agent {
            registry,
            tools,
            executor,
        },
        launcher,
    )
}

fn alice(os_session: &str) -> SessionIdentity {
    SessionIdentity::new("1000", "alice", os_session)
}

fn screenshot_reply(env: &Envelope) -> Envelope {
    let result = IpcCommandResult {
        command_id: env.id.clone(),
        status: "completed".into(),
        result: json!({"status": "completed", "stdout": "png-bytes"}),
        error: String::new(),
    };
    Envelope::new(&env.id, MessageType::CommandResult, &result).unwrap()
}

#[tokio::test]
async fn list_processes_completes_locally() {
    let (agent, _) = agent(false, None, None);
    let (result, found) = agent
        .registry
        .dispatch(&Command::new("c1", "list_processes"))
        .await;
    assert!(found);
    assert_eq!(result.status, CommandStatus::Completed);
    assert!(result.duration_ms > 0);
    assert_eq!(agent.tools.calls(), vec!["list_processes"]);
}

#[tokio::test]
async fn detached_screenshot_forwarded_to_capture_session() {
    let broker = Arc::new(SessionBroker::new());
    let bob = SessionIdentity::new("1001", "bob", "3");
    let _notifier = attach_fake_helper(&broker, bob, &["notify"], DEFAULT_SCOPES).await;
    let helper = attach_fake_helper(&broker, alice("2"), &["capture"], DEFAULT_SCOPES).await;
    let (received, _task) = helper.respond_with(screenshot_reply);

    let (agent, _) = agent(true, Some(broker), None);
    let (result, found) = agent
        .registry
        .dispatch(&Command::new("c2", "take_screenshot"))
        .await;

    assert!(found);
    assert_eq!(result.status, CommandStatus::Completed, "{}", result.error);
    assert_eq!(result.stdout, "png-bytes");
    assert!(result.duration_ms > 0);
    assert_eq!(received.load(Ordering::SeqCst), 1);
    assert!(agent.tools.calls().is_empty());
}

#[tokio::test]
async fn screenshot_with_failed_spawn_reports_launch_error() {
    let broker = Arc::new(SessionBroker::new());
    let (agent, launcher) = agent(
        true,
        Some(broker),
        Some(TestLauncher::failing("runuser: permission denied")),
    );

    let (result, _) = agent
        .registry
        .dispatch(&Command::new("c3", "take_screenshot"))
        .await;

    assert_eq!(result.status, CommandStatus::Failed);
    assert!(result.error.contains("spawn failed"), "{}", result.error);
    assert!(result.error.contains("permission denied"));
    assert_eq!(launcher.unwrap().launches(), 1);
}

#[tokio::test(start_paused = true)]
async fn screenshot_with_silent_helper_times_out() {
    let broker = Arc::new(SessionBroker::new());
    let (agent, launcher) = agent(true, Some(broker), Some(TestLauncher::succeeding()));

    let (result, _) = agent
        .registry
        .dispatch(&Command::new("c4", "take_screenshot"))
        .await;

    assert_eq!(result.status, CommandStatus::Failed);
    assert!(
        result.error.contains("did not connect within 5s"),
        "{}",
        result.error
    );
    assert_eq!(launcher.unwrap().launches(), 1);
}

#[tokio::test]
async fn spawned_helper_receives_screenshot() {
    let broker = Arc::new(SessionBroker::new());
    let launch_broker = broker.clone();
    let launcher = TestLauncher::new(move |session| {
        let broker = launch_broker.clone();
        let identity =
            SessionIdentity::new(session.uid.to_string(), &session.username, &session.session);
        tokio::spawn(async move {
            let helper = attach_fake_helper(&broker, identity, &["capture"], DEFAULT_SCOPES).await;
            let (_, task) = helper.respond_with(screenshot_reply);
            let _ = task.await;
        });
        Ok(())
    });
    let (agent, _) = agent(true, Some(broker.clone()), Some(launcher));

    let (result, _) = agent
        .registry
        .dispatch(&Command::new("c5", "take_screenshot"))
        .await;

    assert_eq!(result.status, CommandStatus::Completed, "{}", result.error);
    assert_eq!(result.stdout, "png-bytes");
    assert_eq!(broker.session_count(), 1);
}

#[tokio::test]
async fn run_as_without_scope_never_reaches_helper() {
    let broker = Arc::new(SessionBroker::new());
    let helper = attach_fake_helper(&broker, alice("2"), &["notify"], &["notify", "tray"]).await;
    let (received, _task) = helper.respond_with(screenshot_reply);

    let (agent, _) = agent(true, Some(broker), None);
    let command = Command::new("c6", "script")
        .with_payload(json!({"content": "whoami", "runAs": "alice"}));
    let (result, _) = agent.registry.dispatch(&command).await;

    assert_eq!(result.status, CommandStatus::Failed);
    assert_eq!(result.error, "user helper does not have run_as_user scope");
    assert_eq!(received.load(Ordering::SeqCst), 0);
    assert!(agent.executor.executed().is_empty());
}

#[tokio::test]
async fn attended_agent_captures_locally_without_spawning() {
    let broker = Arc::new(SessionBroker::new());
    let (agent, launcher) = agent(false, Some(broker), Some(TestLauncher::succeeding()));

    let (result, _) = agent
        .registry
        .dispatch(&Command::new("c7", "take_screenshot"))
        .await;

    assert_eq!(result.status, CommandStatus::Completed);
    assert_eq!(agent.tools.calls(), vec!["take_screenshot"]);
    assert_eq!(launcher.unwrap().launches(), 0);
}
