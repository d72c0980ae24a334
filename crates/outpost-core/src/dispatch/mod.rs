//! Command dispatch registry

pub mod handlers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use outpost_traits::{Command, CommandHandler, CommandResult};
use tracing::{debug, warn};

pub use handlers::{AGENT_TYPES, HandlerContext, LOCAL_TOOL_TYPES, build_registry, registered_types};

/// Maps command types to handlers. Built once, then shared read-only.
pub struct DispatchRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl Default for DispatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any previous one for the type
    pub fn register(&mut self, command_type: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(command_type.into(), handler);
    }

    pub fn has(&self, command_type: &str) -> bool {
        self.handlers.contains_key(command_type)
    }

    /// Registered command types, sorted
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler for `command`. Returns `found = false` for unknown types.
    ///
    /// A positive `duration_ms` set by the handler is kept; otherwise the
    /// wall-clock time of the call is recorded, never less than 1 ms.
    pub async fn dispatch(&self, command: &Command) -> (CommandResult, bool) {
        let Some(handler) = self.handlers.get(&command.command_type) else {
            warn!(
                command_id = %command.id,
                command_type = %command.command_type,
                "Unknown command type"
            );
            return (CommandResult::default(), false);
        };

        let started = Instant::now();
        let mut result = handler.handle(command).await;
        if result.duration_ms == 0 {
            result.duration_ms = (started.elapsed().as_millis() as u64).max(1);
        }

        debug!(
            command_id = %command.id,
            command_type = %command.command_type,
            status = %result.status,
            duration_ms = result.duration_ms,
            "Command dispatched"
        );
        (result, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_traits::handler_fn;

    #[tokio::test]
    async fn test_unknown_type_not_found() {
        let registry = DispatchRegistry::new();
        let (_, found) = registry.dispatch(&Command::new("1", "nope")).await;
        assert!(!found);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_fills_duration_for_instant_handlers() {
        let mut registry = DispatchRegistry::new();
        registry.register(
            "instant",
            handler_fn(|_| async { CommandResult::success(&"ok", 0) }),
        );
        let (result, found) = registry.dispatch(&Command::new("1", "instant")).await;
        assert!(found);
        assert!(result.duration_ms >= 1);
    }

    #[tokio::test]
    async fn test_preserves_handler_duration() {
        let mut registry = DispatchRegistry::new();
        registry.register(
            "timed",
            handler_fn(|_| async { CommandResult::success(&"ok", 4242) }),
        );
        let (result, _) = registry.dispatch(&Command::new("1", "timed")).await;
        assert_eq!(result.duration_ms, 4242);
    }

    #[test]
    fn test_list_is_sorted() {
        let mut registry = DispatchRegistry::new();
        registry.register("b", handler_fn(|_| async { CommandResult::default() }));
        registry.register("a", handler_fn(|_| async { CommandResult::default() }));
        assert_eq!(registry.list(), vec!["a", "b"]);
        assert!(registry.has("a"));
    }
}
