use crate::tools::base::Tool;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde_json::{Map, Value, json};
use std::time::Duration;
use url::Url;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_7_2) AppleWebKit/537.36";
const BRAVE_SEARCH_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";
const REQUEST_TIMEOUT_S: u64 = 30;

fn strip_tags(text: &str) -> String {
    let script_re = Regex::new(r"(?is)<script[\s\S]*?</script>").expect("static regex");
    let style_re = Regex::new(r"(?is)<style[\s\S]*?</style>").expect("static regex");
    let tag_re = Regex::new(r"(?is)<[^>]+>").expect("static regex");
    let no_script = script_re.replace_all(text, "");
    let no_style = style_re.replace_all(&no_script, "");
    let stripped = tag_re.replace_all(&no_style, "");
    html_escape::decode_html_entities(&stripped).to_string()
}

fn normalize_text(text: &str) -> String {
    let whitespace_re = Regex::new(r"[ \t]+").expect("static regex");
    let breaks_re = Regex::new(r"\n{3,}").expect("static regex");
    let collapsed = whitespace_re.replace_all(text, " ");
    breaks_re.replace_all(&collapsed, "\n\n").trim().to_string()
}

fn validate_url(url: &str) -> Result<()> {
    let parsed = Url::parse(url)?;
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => return Err(anyhow!("Only http/https allowed, got '{scheme}'")),
    }
    if parsed.host_str().is_none() {
        return Err(anyhow!("Missing domain"));
    }
    Ok(())
}

/// Brave-backed web search. Without an API key the tool stays registered
/// but answers with a configuration hint.
pub struct WebSearchTool {
    api_key: String,
    max_results: usize,
}

impl WebSearchTool {
    pub fn new(api_key: Option<String>, max_results: usize) -> Self {
        let api_key = api_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| {
                std::env::var("BRAVE_API_KEY")
                    .unwrap_or_default()
                    .trim()
                    .to_string()
            });
        Self {
            api_key,
            max_results: max_results.clamp(1, 10),
        }
    }

    async fn search_brave(&self, query: &str, count: usize) -> Result<Vec<(String, String, String)>> {
        let client = reqwest::Client::new();
        let response = client
            .get(BRAVE_SEARCH_ENDPOINT)
            .query(&[("q", query), ("count", &count.to_string())])
            .header(ACCEPT, "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_S))
            .send()
            .await?
            .error_for_status()?;
        let payload: Value = response.json().await?;

        let results = payload
            .get("web")
            .and_then(|v| v.get("results"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        for item in results {
            let title = item
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let url = item
                .get("url")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let description = strip_tags(
                item.get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
            );
            if !title.is_empty() && !url.is_empty() {
                out.push((title, url, description));
            }
        }
        Ok(out)
    }

    fn format_results(query: &str, results: &[(String, String, String)], limit: usize) -> String {
        if results.is_empty() {
            return format!("No results for: {query}");
        }
        let mut lines = vec![format!("Results for: {query}\n")];
        for (idx, (title, url, desc)) in results.iter().take(limit).enumerate() {
            lines.push(format!("{}. {title}\n   {url}", idx + 1));
            if !desc.is_empty() {
                lines.push(format!("   {desc}"));
            }
        }
        lines.join("\n")
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web and return the top results with titles, URLs and snippets."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "The search query" },
                "count": { "type": "integer", "minimum": 1, "maximum": 10, "description": "Number of results to return" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<String> {
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing required string field: query"))?;
        if self.api_key.is_empty() {
            return Ok(
                "Error: Web search not configured. Set tools.web.search.apiKey or BRAVE_API_KEY."
                    .to_string(),
            );
        }

        let count = params
            .get("count")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(self.max_results)
            .clamp(1, 10);

        match self.search_brave(query, count).await {
            Ok(results) => Ok(Self::format_results(query, &results, count)),
            Err(err) => Ok(format!("Error searching the web: {err}")),
        }
    }
}

/// Fetch a page and reduce it to readable text.
pub struct WebFetchTool {
    max_chars: usize,
}

impl WebFetchTool {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL and return its text content."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "The http(s) URL to fetch" }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<String> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing required string field: url"))?;
        if let Err(err) = validate_url(url) {
            return Ok(format!("Error: Invalid URL: {err}"));
        }

        let client = reqwest::Client::new();
        let response = match client
            .get(url)
            .header(USER_AGENT, DEFAULT_USER_AGENT)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_S))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return Ok(format!("Error fetching {url}: {err}")),
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => return Ok(format!("Error reading body of {url}: {err}")),
        };
        if !status.is_success() {
            return Ok(format!("Error fetching {url}: HTTP {status}"));
        }

        let mut text = normalize_text(&strip_tags(&body));
        if text.len() > self.max_chars {
            let head: String = text.chars().take(self.max_chars).collect();
            text = format!("{head}\n... (truncated)");
        }
        Ok(text)
    }
}
