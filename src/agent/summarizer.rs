use crate::providers::LLMProvider;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error};

const SUMMARIZE_PROMPT: &str = "You are the internal summarizer that keeps the context window small.
Summarize the following conversation concisely on these points:
- Key decisions made
- Important facts learned
- Action items or commitments
- Unresolved questions

Keep it short but contextual; the assistant needs to understand what is going on. No styling.";

const EXTRACT_FACTS_PROMPT: &str = "Extract only the important long-term facts from this conversation.
These should be things worth remembering permanently:
- User preferences or personal information
- Project details or technical decisions
- Commitments or recurring topics
- Corrections to previous knowledge

Return only facts worth keeping. If nothing is worth remembering long-term, say \"Nothing to extract.\"
Format as bullet points.";

#[derive(Debug, Clone)]
pub struct SessionDigest {
    pub summary: String,
    pub facts: String,
}

/// LLM-driven conversation summarization, shared by sliding-window
/// compaction and the daily consolidation job.
pub struct Summarizer {
    provider: Arc<dyn LLMProvider>,
    model: String,
    timeout_s: Option<u64>,
}

impl Summarizer {
    pub fn new(provider: Arc<dyn LLMProvider>, model: Option<String>, timeout_s: Option<u64>) -> Self {
        let model = model.unwrap_or_else(|| provider.default_model().to_string());
        Self {
            provider,
            model,
            timeout_s,
        }
    }

    /// Summarize `messages`. Never errors: a provider failure comes back as
    /// a placeholder marker so callers still hold a non-empty record.
    pub async fn summarize_messages(&self, messages: &[Value], prompt: Option<&str>) -> String {
        if messages.is_empty() {
            return String::new();
        }
        let formatted = format_for_summary(messages);
        if formatted.trim().is_empty() {
            return String::new();
        }

        let request = vec![
            json!({ "role": "system", "content": prompt.unwrap_or(SUMMARIZE_PROMPT) }),
            json!({ "role": "user", "content": formatted }),
        ];
        match self
            .provider
            .chat(&request, None, Some(&self.model), 1024, 0.3, self.timeout_s)
            .await
        {
            Ok(response) if response.finish_reason != "error" => {
                let summary = response.content.unwrap_or_default().trim().to_string();
                debug!("summarized {} messages into {} chars", messages.len(), summary.len());
                summary
            }
            Ok(response) => {
                error!(
                    "summarization failed: {}",
                    response.content.unwrap_or_default()
                );
                format!("[Summary unavailable: {} messages]", messages.len())
            }
            Err(err) => {
                error!("summarization failed: {err}");
                format!("[Summary unavailable: {} messages]", messages.len())
            }
        }
    }

    /// Extract facts worth keeping permanently. Empty string when the model
    /// reports nothing to extract or the call fails.
    pub async fn extract_facts(&self, messages: &[Value]) -> String {
        if messages.is_empty() {
            return String::new();
        }
        let formatted = format_for_summary(messages);
        if formatted.trim().is_empty() {
            return String::new();
        }

        let request = vec![
            json!({ "role": "system", "content": EXTRACT_FACTS_PROMPT }),
            json!({ "role": "user", "content": formatted }),
        ];
        match self
            .provider
            .chat(&request, None, Some(&self.model), 512, 0.2, self.timeout_s)
            .await
        {
            Ok(response) if response.finish_reason != "error" => {
                let facts = response.content.unwrap_or_default().trim().to_string();
                if facts.is_empty() || facts.to_lowercase().contains("nothing to extract") {
                    String::new()
                } else {
                    facts
                }
            }
            Ok(_) | Err(_) => {
                error!("fact extraction failed");
                String::new()
            }
        }
    }

    pub async fn summarize_session(&self, messages: &[Value], session_key: &str) -> SessionDigest {
        debug!(
            "summarizing session {session_key} ({} messages)",
            messages.len()
        );
        SessionDigest {
            summary: self.summarize_messages(messages, None).await,
            facts: self.extract_facts(messages).await,
        }
    }
}

/// Render messages as `Role: content` lines, dropping system and tool
/// records which only add noise to a summary.
fn format_for_summary(messages: &[Value]) -> String {
    let mut lines = Vec::new();
    for msg in messages {
        let role = msg.get("role").and_then(Value::as_str).unwrap_or("unknown");
        if role == "system" || role == "tool" {
            continue;
        }
        let Some(content) = msg.get("content").and_then(Value::as_str) else {
            continue;
        };
        if content.is_empty() {
            continue;
        }
        let label = match role {
            "user" => "User",
            "assistant" => "Assistant",
            other => other,
        };
        lines.push(format!("{label}: {content}"));
    }
    lines.join("\n\n")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::providers::{LLMResponse, ToolCallRequest};
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::Mutex;

    /// Scripted provider: pops one canned response per call.
    pub(crate) struct MockProvider {
        responses: Mutex<Vec<LLMResponse>>,
        pub calls: Mutex<Vec<Vec<Value>>>,
    }

    impl MockProvider {
        pub fn new(responses: Vec<LLMResponse>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn text(content: &str) -> LLMResponse {
            LLMResponse {
                content: Some(content.to_string()),
                finish_reason: "stop".to_string(),
                ..Default::default()
            }
        }

        pub fn tool_call(id: &str, name: &str, arguments: Value) -> LLMResponse {
            LLMResponse {
                tool_calls: vec![ToolCallRequest {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments: arguments.as_object().cloned().unwrap_or(Map::new()),
                }],
                finish_reason: "tool_calls".to_string(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl LLMProvider for MockProvider {
        async fn chat(
            &self,
            messages: &[Value],
            _tools: Option<&[Value]>,
            _model: Option<&str>,
            _max_tokens: u32,
            _temperature: f32,
            _timeout_s: Option<u64>,
        ) -> anyhow::Result<LLMResponse> {
            self.calls
                .lock()
                .expect("calls lock")
                .push(messages.to_vec());
            let mut responses = self.responses.lock().expect("responses lock");
            if responses.is_empty() {
                Ok(LLMResponse::error("mock exhausted"))
            } else {
                Ok(responses.remove(0))
            }
        }

        fn default_model(&self) -> &str {
            "mock-model"
        }
    }

    fn conversation() -> Vec<Value> {
        vec![
            json!({ "role": "system", "content": "you are a bot" }),
            json!({ "role": "user", "content": "remember I like tea" }),
            json!({ "role": "tool", "content": "raw tool output" }),
            json!({ "role": "assistant", "content": "noted" }),
        ]
    }

    #[test]
    fn format_skips_system_and_tool_messages() {
        let text = format_for_summary(&conversation());
        assert!(text.contains("User: remember I like tea"));
        assert!(text.contains("Assistant: noted"));
        assert!(!text.contains("you are a bot"));
        assert!(!text.contains("raw tool output"));
    }

    #[tokio::test]
    async fn summarize_returns_provider_content() {
        let provider = Arc::new(MockProvider::new(vec![MockProvider::text("S")]));
        let summarizer = Summarizer::new(provider, None, Some(30));
        let summary = summarizer.summarize_messages(&conversation(), None).await;
        assert_eq!(summary, "S");
    }

    #[tokio::test]
    async fn summarize_failure_yields_placeholder() {
        let provider = Arc::new(MockProvider::new(vec![LLMResponse::error("boom")]));
        let summarizer = Summarizer::new(provider, None, Some(30));
        let summary = summarizer.summarize_messages(&conversation(), None).await;
        assert_eq!(summary, "[Summary unavailable: 4 messages]");
    }

    #[tokio::test]
    async fn summarize_empty_input_is_empty() {
        let provider = Arc::new(MockProvider::new(vec![]));
        let summarizer = Summarizer::new(provider, None, None);
        assert_eq!(summarizer.summarize_messages(&[], None).await, "");
    }

    #[tokio::test]
    async fn extract_facts_filters_nothing_to_extract() {
        let provider = Arc::new(MockProvider::new(vec![MockProvider::text(
            "Nothing to extract.",
        )]));
        let summarizer = Summarizer::new(provider, None, None);
        assert_eq!(summarizer.extract_facts(&conversation()).await, "");
    }

    #[tokio::test]
    async fn extract_facts_returns_bullets() {
        let provider = Arc::new(MockProvider::new(vec![MockProvider::text(
            "- user likes tea",
        )]));
        let summarizer = Summarizer::new(provider, None, None);
        assert_eq!(
            summarizer.extract_facts(&conversation()).await,
            "- user likes tea"
        );
    }

    #[tokio::test]
    async fn summarize_session_combines_both() {
        let provider = Arc::new(MockProvider::new(vec![
            MockProvider::text("the summary"),
            MockProvider::text("- a fact"),
        ]));
        let summarizer = Summarizer::new(provider, None, None);
        let digest = summarizer.summarize_session(&conversation(), "cli:test").await;
        assert_eq!(digest.summary, "the summary");
        assert_eq!(digest.facts, "- a fact");
    }
}
