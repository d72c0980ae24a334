use anyhow::Result;
use std::path::PathBuf;

const OUTPOST_DIR: &str = ".outpost";
const CONFIG_FILE: &str = "config.toml";
const LOGS_DIR: &str = "logs";
const SOCKET_FILE: &str = "outpost-broker.sock";
const SYSTEM_SOCKET: &str = "/run/outpost/outpost-broker.sock";

/// Environment variable to override the Outpost directory.
const OUTPOST_DIR_ENV: &str = "OUTPOST_DIR";

/// Environment variable to override the broker socket path.
const OUTPOST_SOCKET_ENV: &str = "OUTPOST_SOCKET";

fn env_override(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

/// Resolve the Outpost data directory.
/// Priority: OUTPOST_DIR env var > ~/.outpost/
pub fn resolve_outpost_dir() -> Result<PathBuf> {
    if let Some(dir) = env_override(OUTPOST_DIR_ENV) {
        return Ok(dir);
    }
    dirs::home_dir()
        .map(|h| h.join(OUTPOST_DIR))
        .ok_or_else(|| anyhow::anyhow!("Failed to determine home directory"))
}

/// Ensure the Outpost directory exists and return its path.
pub fn ensure_outpost_dir() -> Result<PathBuf> {
    let dir = resolve_outpost_dir()?;
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Get the config file path: ~/.outpost/config.toml
pub fn config_path() -> Result<PathBuf> {
    Ok(resolve_outpost_dir()?.join(CONFIG_FILE))
}

/// Get the logs directory: ~/.outpost/logs/
pub fn logs_dir() -> Result<PathBuf> {
    let dir = resolve_outpost_dir()?.join(LOGS_DIR);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Broker socket shared by the service and helpers running as other users.
/// Priority: OUTPOST_SOCKET > $OUTPOST_DIR/outpost-broker.sock > /run/outpost/outpost-broker.sock
pub fn socket_path() -> PathBuf {
    if let Some(path) = env_override(OUTPOST_SOCKET_ENV) {
        return path;
    }
    if let Some(dir) = env_override(OUTPOST_DIR_ENV) {
        return dir.join(SOCKET_FILE);
    }
    PathBuf::from(SYSTEM_SOCKET)
}
