use flowcore::{FlowGraph, GraphError, Tool};
use std::collections::HashMap;
use std::sync::Arc;

/// Tools resolved for one flow, keyed by node name.
pub type NodeTools = HashMap<String, Arc<dyn Tool>>;

/// Registry of available tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool under `name`, replacing any previous registration.
    pub fn register(&mut self, name: impl Into<String>, tool: Arc<dyn Tool>) {
        let name = name.into();
        tracing::info!("Registering tool: {}", name);
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Get all registered tool names, sorted
    pub fn list_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up the tool of every node in `graph`.
    pub fn resolve(&self, graph: &FlowGraph) -> Result<NodeTools, GraphError> {
        graph
            .nodes
            .iter()
            .map(|node| {
                self.get(&node.tool)
                    .map(|tool| (node.name.clone(), tool))
                    .ok_or_else(|| GraphError::UnknownTool {
                        node: node.name.clone(),
                        tool: node.tool.clone(),
                    })
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
