use crate::tools::base::Tool;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Name-indexed tool catalog. Dispatch is a table lookup; argument
/// validation runs against each tool's declared schema before execution.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        debug!("registering tool {}", tool.name());
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn unregister(&mut self, name: &str) {
        self.tools.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn get_definitions(&self) -> Vec<Value> {
        self.tools.values().map(|tool| tool.to_schema()).collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate and run a tool. Every failure mode comes back as a
    /// diagnostic string for the model.
    pub async fn execute(&self, name: &str, params: &Map<String, Value>) -> String {
        let Some(tool) = self.tools.get(name) else {
            return format!("Error: Tool '{name}' not found");
        };

        let errors = tool.validate_params(params);
        if !errors.is_empty() {
            return format!(
                "Error: Invalid parameters for tool '{name}': {}",
                errors.join("; ")
            );
        }

        match tool.execute(params).await {
            Ok(output) => output,
            Err(err) => format!("Error executing {name}: {err}"),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
