use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use outpost_core::config::AgentConfig;
use outpost_core::helper::{HelperClient, LocalHelperActions};
use outpost_core::ShellScriptExecutor;
use tokio::sync::broadcast;
use tracing::info;

use crate::cli::UserHelperArgs;

pub async fn run(config: AgentConfig, args: UserHelperArgs) -> Result<()> {
    let socket = args.socket.unwrap_or_else(|| config.socket_path());
    let actions = LocalHelperActions::detect().with_capture_command(args.capture_command);
    let client = HelperClient::new(
        socket.clone(),
        Arc::new(actions),
        Arc::new(ShellScriptExecutor::new()),
    )
    .with_keepalive(Duration::from_secs(config.helper.keepalive_secs));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    super::spawn_shutdown_signal(shutdown_tx);

    info!(socket = %socket.display(), "User helper starting");
    client.run(shutdown_rx).await?;
    info!("User helper stopped");
    Ok(())
}
