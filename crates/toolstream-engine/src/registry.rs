use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use toolstream_core::tools::{Tool, ToolDefinition};

/// Where a registered tool comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSource {
    BuiltIn,
    /// Handler supplied by the embedding application.
    External,
}

/// A registered tool as reported by `GET /api/tools`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolListing {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub source: ToolSource,
}

struct ToolEntry {
    tool: Arc<dyn Tool>,
    source: ToolSource,
}

/// Static name → (schema, handler) table consulted by the dispatch loop.
pub struct ToolRegistry {
    tools: HashMap<String, ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. A later registration under the same name replaces
    /// the earlier one.
    pub fn register(&mut self, tool: Arc<dyn Tool>, source: ToolSource) {
        let name = tool.name().to_string();
        self.tools.insert(name, ToolEntry { tool, source });
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|e| Arc::clone(&e.tool))
    }

    /// Definitions surfaced to the model, sorted by name so requests are
    /// stable across rounds.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|e| e.tool.to_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Every tool with its origin, sorted by name.
    pub fn listings(&self) -> Vec<ToolListing> {
        let mut listings: Vec<ToolListing> = self
            .tools
            .values()
            .map(|e| {
                let def = e.tool.to_definition();
                ToolListing {
                    name: def.name,
                    description: def.description,
                    parameters: def.parameters,
                    source: e.source,
                }
            })
            .collect();
        listings.sort_by(|a, b| a.name.cmp(&b.name));
        listings
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
