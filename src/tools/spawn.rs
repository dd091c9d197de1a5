use crate::agent::subagent::SubagentManager;
use crate::tools::base::Tool;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::{Arc, Mutex};

/// Where the current turn came from; completed subagents report back here.
struct OriginSlot {
    channel: String,
    chat_id: String,
}

impl Default for OriginSlot {
    fn default() -> Self {
        Self {
            channel: "cli".to_string(),
            chat_id: "direct".to_string(),
        }
    }
}

/// Hands a task to the subagent manager and returns immediately; the
/// subagent publishes its own result to the origin chat when it finishes.
pub struct SpawnTool {
    manager: Arc<SubagentManager>,
    origin: Mutex<OriginSlot>,
}

impl SpawnTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self {
            manager,
            origin: Mutex::new(OriginSlot::default()),
        }
    }

    pub fn set_context(&self, channel: impl Into<String>, chat_id: impl Into<String>) {
        if let Ok(mut origin) = self.origin.lock() {
            origin.channel = channel.into();
            origin.chat_id = chat_id.into();
        }
    }

    fn origin(&self) -> Result<(String, String)> {
        let origin = self
            .origin
            .lock()
            .map_err(|_| anyhow!("failed to lock spawn origin"))?;
        Ok((origin.channel.clone(), origin.chat_id.clone()))
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Spawn a subagent to handle a task in the background. Use this for complex or time-consuming tasks."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": { "type": "string", "description": "The task for the subagent to complete" },
                "label": { "type": "string", "description": "Optional short label for the task" }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<String> {
        let task = params
            .get("task")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if task.is_empty() {
            return Ok("Error: task must not be empty".to_string());
        }
        let label = params
            .get("label")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(ToOwned::to_owned);

        let (channel, chat_id) = self.origin()?;
        Ok(self
            .manager
            .spawn(task.to_string(), label, channel, chat_id)
            .await)
    }
}
