use crate::tools::base::Tool;
use crate::utils::truncate_string;
use crate::vector_memory::{MemoryTag, VectorMemory};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// Explicit memory operations against the semantic memory collaborator.
pub struct MemoryTool {
    memory: Arc<dyn VectorMemory>,
    author: String,
}

impl MemoryTool {
    pub fn new(memory: Arc<dyn VectorMemory>, author: impl Into<String>) -> Self {
        Self {
            memory,
            author: author.into(),
        }
    }

    async fn remember(
        &self,
        content: Option<&str>,
        tag: MemoryTag,
        categories: Vec<String>,
    ) -> String {
        let Some(content) = content.filter(|c| !c.trim().is_empty()) else {
            return "Error: content is required for remember action".to_string();
        };

        match self
            .memory
            .add(content, &self.author, tag, categories.clone(), Some("tool"))
            .await
        {
            Ok(Some(record)) => format!(
                "Remembered: {}\nID: {}",
                truncate_string(content, 100),
                record.id
            ),
            Ok(None) => "Memory was deduplicated (already exists or too similar)".to_string(),
            Err(err) => format!("Error storing memory: {err}"),
        }
    }

    async fn recall(&self, query: Option<&str>) -> String {
        let Some(query) = query.filter(|q| !q.trim().is_empty()) else {
            return "Error: content (query) is required for recall action".to_string();
        };

        match self.memory.search(query, 5).await {
            Ok(results) if results.is_empty() => format!("No memories found for: {query}"),
            Ok(results) => {
                let mut lines = vec![format!("Found {} memories for: {query}\n", results.len())];
                for (idx, record) in results.iter().enumerate() {
                    let distance = record
                        .distance
                        .map(|d| format!("{d:.3}"))
                        .unwrap_or_else(|| "?".to_string());
                    lines.push(format!(
                        "{}. [{:?}, w={:.2}, d={distance}]\n   {}\n   ID: {}",
                        idx + 1,
                        record.metadata.tag,
                        record.metadata.weight,
                        truncate_string(&record.content, 200),
                        record.id
                    ));
                }
                lines.join("\n")
            }
            Err(err) => format!("Error searching memories: {err}"),
        }
    }

    async fn forget(&self, memory_id: Option<&str>) -> String {
        let Some(memory_id) = memory_id.filter(|id| !id.is_empty()) else {
            return "Error: memory_id is required for forget action".to_string();
        };

        match self.memory.delete(memory_id).await {
            Ok(true) => format!("Deleted memory: {memory_id}"),
            Ok(false) => format!("Memory not found: {memory_id}"),
            Err(err) => format!("Error deleting memory: {err}"),
        }
    }
}

#[async_trait]
impl Tool for MemoryTool {
    fn name(&self) -> &str {
        "memory"
    }

    fn description(&self) -> &str {
        "Remember, recall, or forget information. Use 'remember' to store facts, 'recall' to search memories, 'forget' to delete."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["remember", "recall", "forget"],
                    "description": "The memory action to perform"
                },
                "content": {
                    "type": "string",
                    "description": "For remember: the fact to store. For recall: the search query."
                },
                "tag": {
                    "type": "string",
                    "enum": ["core", "crucial", "default"],
                    "description": "Memory importance (core=permanent, crucial=slow decay, default=normal decay)"
                },
                "categories": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Semantic categories for the memory"
                },
                "memory_id": {
                    "type": "string",
                    "description": "For forget: the ID of the memory to delete"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<String> {
        let action = params
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing required string field: action"))?;
        let content = params.get("content").and_then(Value::as_str);
        let memory_id = params.get("memory_id").and_then(Value::as_str);
        let tag = match params.get("tag").and_then(Value::as_str) {
            Some("core") => MemoryTag::Core,
            Some("crucial") => MemoryTag::Crucial,
            _ => MemoryTag::Default,
        };
        let categories = params
            .get("categories")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Ok(match action {
            "remember" => self.remember(content, tag, categories).await,
            "recall" => self.recall(content).await,
            "forget" => self.forget(memory_id).await,
            other => format!("Unknown action: {other}"),
        })
    }
}
