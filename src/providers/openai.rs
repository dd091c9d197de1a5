use crate::providers::base::{LLMProvider, LLMResponse, ToolCallRequest};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;

/// Client for any OpenAI-compatible chat-completions endpoint.
#[derive(Clone)]
pub struct OpenAIProvider {
    api_key: String,
    api_base: String,
    default_model: String,
    extra_headers: HashMap<String, String>,
    client: Client,
}

impl OpenAIProvider {
    pub fn new(
        api_key: impl Into<String>,
        api_base: Option<String>,
        default_model: impl Into<String>,
        extra_headers: Option<HashMap<String, String>>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            api_base: api_base.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            default_model: default_model.into(),
            extra_headers: extra_headers.unwrap_or_default(),
            client: Client::new(),
        }
    }

    fn parse_response(payload: Value) -> LLMResponse {
        let choice = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|v| v.first())
            .cloned()
            .unwrap_or_else(|| json!({}));

        let message = choice.get("message").cloned().unwrap_or_else(|| json!({}));
        let content = message
            .get("content")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        let reasoning_content = message
            .get("reasoning_content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned);

        let tool_calls = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|tc| {
                        let id = tc.get("id")?.as_str()?.to_string();
                        let function = tc.get("function")?;
                        let name = function.get("name")?.as_str()?.to_string();
                        let args_raw = function
                            .get("arguments")
                            .and_then(Value::as_str)
                            .unwrap_or("{}");
                        let args_value: Value = serde_json::from_str(args_raw)
                            .unwrap_or_else(|_| json!({ "raw": args_raw }));
                        let arguments = args_value.as_object().cloned().unwrap_or_default();
                        Some(ToolCallRequest {
                            id,
                            name,
                            arguments,
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let finish_reason = choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .unwrap_or("stop")
            .to_string();

        let usage = payload
            .get("usage")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        LLMResponse {
            content,
            tool_calls,
            reasoning_content,
            finish_reason,
            usage,
        }
    }
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    async fn chat(
        &self,
        messages: &[Value],
        tools: Option<&[Value]>,
        model: Option<&str>,
        max_tokens: u32,
        temperature: f32,
        timeout_s: Option<u64>,
    ) -> anyhow::Result<LLMResponse> {
        let model_name = model.unwrap_or(&self.default_model).to_string();
        let mut body = json!({
            "model": model_name,
            "messages": messages,
            "max_tokens": max_tokens,
            "temperature": temperature,
        });
        if let Some(tool_defs) = tools
            && !tool_defs.is_empty()
        {
            body["tools"] = Value::Array(tool_defs.to_vec());
            body["tool_choice"] = Value::String("auto".to_string());
        }

        let url = format!("{}/chat/completions", self.api_base.trim_end_matches('/'));
        let mut request = self.client.post(url).bearer_auth(&self.api_key).json(&body);
        for (key, value) in &self.extra_headers {
            request = request.header(key, value);
        }
        if let Some(seconds) = timeout_s {
            request = request.timeout(Duration::from_secs(seconds));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return Ok(LLMResponse::error(format!("Error calling LLM: {err}"))),
        };

        let status = response.status();
        let payload: Value = match response.json().await {
            Ok(payload) => payload,
            Err(err) => {
                return Ok(LLMResponse::error(format!(
                    "Error parsing LLM response: {err}"
                )));
            }
        };
        if !status.is_success() {
            return Ok(LLMResponse::error(format!("Error calling LLM: {payload}")));
        }

        Ok(Self::parse_response(payload))
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}
