//! Error kinds surfaced by command handlers and the routing layer.

use std::time::Duration;

/// Result alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// A required payload field is missing or malformed.
    #[error("{0}")]
    Validation(String),

    #[error("unknown command type: {0}")]
    NotFound(String),

    /// The target session was not granted the scope the action needs.
    #[error("user helper does not have {0} scope")]
    Authorization(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Timeout(String),

    /// Connection failure or close while a request was outstanding.
    #[error("{0}")]
    Transport(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    pub fn missing_field(name: &str) -> Self {
        AgentError::Validation(format!("{name} is required"))
    }

    pub fn timed_out(after: Duration) -> Self {
        AgentError::Timeout(format!("command timed out after {after:?}"))
    }

    /// Whether the caller may reasonably try again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::Unavailable(_) | AgentError::Timeout(_) | AgentError::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_message_names_scope() {
        let err = AgentError::Authorization("run_as_user".to_string());
        assert_eq!(err.to_string(), "user helper does not have run_as_user scope");
    }

    #[test]
    fn test_missing_field_message() {
        assert_eq!(AgentError::missing_field("body").to_string(), "body is required");
    }

    #[test]
    fn test_transient_classification() {
        assert!(AgentError::timed_out(Duration::from_secs(1)).is_transient());
        assert!(!AgentError::Validation("x".into()).is_transient());
        assert!(!AgentError::NotFound("x".into()).is_transient());
    }
}
