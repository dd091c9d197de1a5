use crate::utils::{expand_tilde, get_data_path};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderConfig {
    pub api_key: String,
    pub api_base: Option<String>,
    pub extra_headers: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ProvidersConfig {
    pub anthropic: ProviderConfig,
    pub openai: ProviderConfig,
    pub openrouter: ProviderConfig,
    pub deepseek: ProviderConfig,
    pub groq: ProviderConfig,
    pub vllm: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentDefaults {
    pub workspace: String,
    pub model: String,
    pub summarizer_model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_tool_iterations: u32,
    pub memory_window: usize,
    pub llm_timeout: u64,
    pub daily_summary_hour: u32,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace: "~/.nightowl/workspace".to_string(),
            model: "anthropic/claude-opus-4-5".to_string(),
            summarizer_model: None,
            max_tokens: 8192,
            temperature: 0.7,
            max_tool_iterations: 20,
            memory_window: 50,
            llm_timeout: 60,
            daily_summary_hour: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebSearchConfig {
    pub api_key: String,
    pub max_results: usize,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            max_results: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct WebToolsConfig {
    pub search: WebSearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecToolConfig {
    pub timeout: u64,
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self { timeout: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolsConfig {
    pub web: WebToolsConfig,
    pub exec: ExecToolConfig,
    pub restrict_to_workspace: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct TelegramConfig {
    pub enabled: bool,
    pub token: String,
    pub allow_from: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WhatsAppConfig {
    pub enabled: bool,
    pub bridge_url: String,
    pub allow_from: Vec<String>,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bridge_url: "ws://localhost:3001".to_string(),
            allow_from: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelsConfig {
    pub telegram: TelegramConfig,
    pub whatsapp: WhatsAppConfig,
}

/// One out-of-process MCP tool server. `env` keys pass through verbatim:
/// serde's rename rules apply to struct fields, never to map keys.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct McpServerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub agents: AgentsConfig,
    pub channels: ChannelsConfig,
    pub providers: ProvidersConfig,
    pub tools: ToolsConfig,
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

impl Config {
    pub fn workspace_path(&self) -> PathBuf {
        expand_tilde(&self.agents.defaults.workspace)
    }

    fn match_provider(&self, model: Option<&str>) -> Option<(&ProviderConfig, &'static str)> {
        let m = model.unwrap_or(&self.agents.defaults.model).to_lowercase();
        let mapping: [(&'static str, &[&str]); 6] = [
            ("openrouter", &["openrouter"]),
            ("anthropic", &["anthropic", "claude"]),
            ("openai", &["openai", "gpt"]),
            ("deepseek", &["deepseek"]),
            ("groq", &["groq"]),
            ("vllm", &["vllm"]),
        ];

        for (name, keywords) in mapping {
            let provider = self.provider_by_name(name);
            if keywords.iter().any(|kw| m.contains(kw)) && provider.is_configured() {
                return Some((provider, name));
            }
        }

        // No keyword match: first provider with credentials wins.
        for (name, _) in mapping {
            let provider = self.provider_by_name(name);
            if provider.is_configured() {
                return Some((provider, name));
            }
        }
        None
    }

    fn provider_by_name(&self, name: &str) -> &ProviderConfig {
        match name {
            "anthropic" => &self.providers.anthropic,
            "openrouter" => &self.providers.openrouter,
            "deepseek" => &self.providers.deepseek,
            "groq" => &self.providers.groq,
            "vllm" => &self.providers.vllm,
            _ => &self.providers.openai,
        }
    }

    pub fn get_provider(&self, model: Option<&str>) -> Option<&ProviderConfig> {
        self.match_provider(model).map(|(provider, _)| provider)
    }

    pub fn get_api_key(&self, model: Option<&str>) -> Option<String> {
        self.get_provider(model).map(|p| p.api_key.clone())
    }

    pub fn get_api_base(&self, model: Option<&str>) -> Option<String> {
        let (provider, name) = self.match_provider(model)?;
        if provider.api_base.is_some() {
            return provider.api_base.clone();
        }
        match name {
            "openrouter" => Some("https://openrouter.ai/api/v1".to_string()),
            "deepseek" => Some("https://api.deepseek.com/v1".to_string()),
            "groq" => Some("https://api.groq.com/openai/v1".to_string()),
            _ => None,
        }
    }
}

impl ProviderConfig {
    fn is_configured(&self) -> bool {
        !self.api_key.is_empty() || self.api_base.is_some()
    }
}

pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_data_path()?.join("config.json"))
}

pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => get_config_path()?,
    };

    if !path.exists() {
        return Ok(Config::default());
    }

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    let config = serde_json::from_value(value).context("failed to parse config structure")?;
    Ok(config)
}

pub fn save_config(config: &Config, config_path: Option<&Path>) -> Result<()> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => get_config_path()?,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, text)?;
    Ok(())
}

pub fn providers_status(config: &Config) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(
        "anthropic".to_string(),
        Value::Bool(!config.providers.anthropic.api_key.is_empty()),
    );
    map.insert(
        "openai".to_string(),
        Value::Bool(!config.providers.openai.api_key.is_empty()),
    );
    map.insert(
        "openrouter".to_string(),
        Value::Bool(!config.providers.openrouter.api_key.is_empty()),
    );
    map.insert(
        "deepseek".to_string(),
        Value::Bool(!config.providers.deepseek.api_key.is_empty()),
    );
    map.insert(
        "groq".to_string(),
        Value::Bool(!config.providers.groq.api_key.is_empty()),
    );
    map.insert(
        "vllm".to_string(),
        Value::Bool(config.providers.vllm.api_base.is_some()),
    );
    map
}
