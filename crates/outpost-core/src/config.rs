//! Agent configuration file support
//!
//! Loads configuration from ~/.outpost/config.toml (or $OUTPOST_DIR/config.toml).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::broker::ListenerConfig;
use crate::broker::listener::DEFAULT_SCOPES;
use crate::paths;
use crate::router::RouterConfig;

/// Whether the agent runs without access to an interactive desktop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetachedMode {
    /// Detached when running as root with no display in the environment.
    #[default]
    Auto,
    Always,
    Never,
}

impl DetachedMode {
    pub fn resolve(self) -> bool {
        match self {
            DetachedMode::Always => true,
            DetachedMode::Never => false,
            DetachedMode::Auto => {
                let has_display = ["DISPLAY", "WAYLAND_DISPLAY"]
                    .iter()
                    .any(|var| std::env::var_os(var).is_some_and(|v| !v.is_empty()));
                is_root() && !has_display
            }
        }
    }
}

#[cfg(unix)]
fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Broker socket; defaults to the system socket path
    pub socket_path: Option<PathBuf>,
    /// Default tracing filter when RUST_LOG is unset
    pub log_level: String,
    pub detached: DetachedMode,
    /// Scopes granted to every authenticated helper
    pub allowed_scopes: Vec<String>,
    /// Require helpers to run the same executable as the service
    pub verify_helper_binary: bool,
    pub helper: HelperConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            log_level: "info".to_string(),
            detached: DetachedMode::Auto,
            allowed_scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            verify_helper_binary: true,
            helper: HelperConfig::default(),
        }
    }
}

/// Helper routing, timeouts, and connection limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    pub enabled: bool,
    pub spawn_poll_interval_ms: u64,
    pub spawn_poll_attempts: u32,
    pub forward_timeout_secs: u64,
    pub capture_timeout_secs: u64,
    pub script_grace_secs: u64,
    pub idle_timeout_secs: u64,
    pub idle_check_interval_secs: u64,
    pub handshake_timeout_secs: u64,
    pub rate_limit_attempts: usize,
    pub rate_limit_window_secs: u64,
    pub max_sessions_per_user: usize,
    pub keepalive_secs: u64,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            spawn_poll_interval_ms: 500,
            spawn_poll_attempts: 10,
            forward_timeout_secs: 10,
            capture_timeout_secs: 30,
            script_grace_secs: 5,
            idle_timeout_secs: 30 * 60,
            idle_check_interval_secs: 60,
            handshake_timeout_secs: 5,
            rate_limit_attempts: 5,
            rate_limit_window_secs: 60,
            max_sessions_per_user: 3,
            keepalive_secs: 60,
        }
    }
}

impl AgentConfig {
    /// Load configuration from the default path, falling back to defaults.
    pub fn load() -> Self {
        match paths::config_path() {
            Ok(path) => Self::load_from_path(&path),
            Err(_) => Self::default(),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Invalid config file, using defaults");
                    Self::default()
                }
            },
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Unreadable config file, using defaults");
                Self::default()
            }
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(paths::socket_path)
    }

    pub fn listener_config(&self, expected_binary_hash: Option<String>) -> ListenerConfig {
        let helper = &self.helper;
        ListenerConfig {
            socket_path: self.socket_path(),
            handshake_timeout: Duration::from_secs(helper.handshake_timeout_secs),
            idle_timeout: Duration::from_secs(helper.idle_timeout_secs),
            idle_check_interval: Duration::from_secs(helper.idle_check_interval_secs.max(1)),
            max_sessions_per_principal: helper.max_sessions_per_user,
            rate_limit_attempts: helper.rate_limit_attempts,
            rate_limit_window: Duration::from_secs(helper.rate_limit_window_secs),
            allowed_scopes: self.allowed_scopes.clone(),
            expected_binary_hash: if self.verify_helper_binary {
                expected_binary_hash
            } else {
                None
            },
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        let helper = &self.helper;
        RouterConfig {
            detached: self.detached.resolve(),
            poll_interval: Duration::from_millis(helper.spawn_poll_interval_ms.max(1)),
            poll_attempts: helper.spawn_poll_attempts.max(1),
            forward_timeout: Duration::from_secs(helper.forward_timeout_secs),
            capture_timeout: Duration::from_secs(helper.capture_timeout_secs),
            script_grace: Duration::from_secs(helper.script_grace_secs),
        }
    }
}
