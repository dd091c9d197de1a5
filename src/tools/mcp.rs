use crate::mcp::client::{McpClient, McpToolInfo};
use crate::tools::base::Tool;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Registry-facing wrapper around one tool advertised by an MCP server.
/// Registered as `{server}_{tool}` so servers cannot shadow each other.
pub struct McpTool {
    client: Arc<McpClient>,
    registered_name: String,
    remote_name: String,
    description: String,
    parameters: Value,
}

impl McpTool {
    pub fn new(client: Arc<McpClient>, info: McpToolInfo) -> Self {
        let registered_name = format!("{}_{}", client.server_name, info.name);
        let description = if info.description.is_empty() {
            format!("Tool '{}' from MCP server '{}'.", info.name, client.server_name)
        } else {
            info.description
        };
        Self {
            client,
            registered_name,
            remote_name: info.name,
            description,
            parameters: info.input_schema,
        }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.registered_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<String> {
        match self.client.call_tool(&self.remote_name, params).await {
            Ok(output) => Ok(output),
            Err(err) => Ok(format!("Error calling MCP tool: {err}")),
        }
    }
}
