use std::fmt;

use serde::{Deserialize, Serialize};

/// Who a helper connection belongs to. One live session per identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    /// Numeric uid on Unix, SID on Windows.
    pub principal: String,
    pub username: String,
    /// OS login session the helper runs in.
    pub os_session: String,
}

impl SessionIdentity {
    pub fn new(
        principal: impl Into<String>,
        username: impl Into<String>,
        os_session: impl Into<String>,
    ) -> Self {
        Self {
            principal: principal.into(),
            username: username.into(),
            os_session: os_session.into(),
        }
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})@{}", self.username, self.principal, self.os_session)
    }
}

/// Optional constraint on which session a routed command may land in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TargetHint {
    #[default]
    Any,
    OsSession(String),
    User(String),
}

impl TargetHint {
    /// `Any` for a missing or empty session id.
    pub fn os_session(id: Option<&str>) -> Self {
        match id {
            Some(id) if !id.is_empty() => TargetHint::OsSession(id.to_string()),
            _ => TargetHint::Any,
        }
    }

    pub fn matches(&self, identity: &SessionIdentity) -> bool {
        match self {
            TargetHint::Any => true,
            TargetHint::OsSession(id) => identity.os_session == *id,
            TargetHint::User(name) => identity.username == *name,
        }
    }

    /// Key used to serialize spawn attempts for the same target.
    pub fn spawn_key(&self) -> String {
        match self {
            TargetHint::Any => "*".to_string(),
            TargetHint::OsSession(id) => format!("session:{id}"),
            TargetHint::User(name) => format!("user:{name}"),
        }
    }
}

impl fmt::Display for TargetHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spawn_key())
    }
}
