pub mod read_state;
pub mod update_state;

use std::sync::Arc;

use crate::registry::{ToolRegistry, ToolSource};

/// Create a ToolRegistry with the built-in shared-state tools.
pub fn create_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry);
    registry
}

pub fn register_builtin_tools(registry: &mut ToolRegistry) {
    registry.register(Arc::new(update_state::UpdateStateTool), ToolSource::BuiltIn);
    registry.register(Arc::new(read_state::ReadStateTool), ToolSource::BuiltIn);
}

/// JSON pointer for a top-level or `/`-separated field name.
pub(crate) fn field_pointer(field: &str) -> String {
    if field.starts_with('/') {
        return field.to_string();
    }
    field
        .split('.')
        .map(|segment| segment.replace('~', "~0").replace('/', "~1"))
        .fold(String::new(), |mut pointer, segment| {
            pointer.push('/');
            pointer.push_str(&segment);
            pointer
        })
}
