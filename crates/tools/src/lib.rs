//! Built-in tool implementations for contextloop.
//!
//! The registry is assembled once at startup and then shared read-only.

pub mod calculator;
pub mod datetime;

use contextloop_core::tool::ToolRegistry;
use std::sync::Arc;

/// Create a registry with all built-in tools.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    // Built-in names are distinct, so registration cannot collide here.
    let _ = registry.register(Arc::new(calculator::CalculatorTool));
    let _ = registry.register(Arc::new(datetime::DateTimeTool));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_builtins() {
        let registry = default_registry();
        assert_eq!(registry.names(), vec!["calculator", "get_current_datetime"]);
    }
}
