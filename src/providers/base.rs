use async_trait::async_trait;
use serde_json::{Map, Value};

/// One tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct LLMResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub reasoning_content: Option<String>,
    pub finish_reason: String,
    pub usage: Map<String, Value>,
}

impl LLMResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Synthetic response for transport or upstream failures. Providers
    /// return this instead of erroring so the agent loop keeps going.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: Some(message.into()),
            finish_reason: "error".to_string(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// One chat completion. `messages` and `tools` are already in wire form.
    /// Upstream failures surface as `finish_reason == "error"` responses,
    /// never as `Err` — the only `Err` path is a bug in request assembly.
    async fn chat(
        &self,
        messages: &[Value],
        tools: Option<&[Value]>,
        model: Option<&str>,
        max_tokens: u32,
        temperature: f32,
        timeout_s: Option<u64>,
    ) -> anyhow::Result<LLMResponse>;

    fn default_model(&self) -> &str;
}
