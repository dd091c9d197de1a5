use crate::config::McpServerConfig;
use anyhow::{Context, Result, anyhow};
use serde_json::{Map, Value, json};
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::{Duration, timeout};
use tracing::{debug, warn};

const PROTOCOL_VERSION: &str = "2025-06-18";
const REQUEST_TIMEOUT_S: u64 = 30;

#[derive(Debug, Clone)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One out-of-process tool server, spoken to over line-delimited JSON-RPC
/// 2.0 on the child's stdio.
pub struct McpClient {
    pub server_name: String,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    next_id: AtomicI64,
}

impl McpClient {
    pub async fn connect(name: &str, config: &McpServerConfig) -> Result<Self> {
        if config.command.is_empty() {
            return Err(anyhow!("MCP server '{name}' has no command configured"));
        }

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in &config.env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn MCP server '{name}'"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("no stdin pipe for MCP server '{name}'"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("no stdout pipe for MCP server '{name}'"))?;

        let client = Self {
            server_name: name.to_string(),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            next_id: AtomicI64::new(1),
        };

        client
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "nightowl",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            )
            .await
            .with_context(|| format!("initialize failed for MCP server '{name}'"))?;
        client.notify("notifications/initialized", json!({})).await?;

        Ok(client)
    }

    async fn write_line(&self, payload: &Value) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let mut line = serde_json::to_string(payload)?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.write_line(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .await
    }

    /// One request/response exchange. Server-initiated notifications that
    /// arrive in between are skipped.
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.write_line(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await?;

        let mut stdout = self.stdout.lock().await;
        let deadline = Duration::from_secs(REQUEST_TIMEOUT_S);
        loop {
            let mut line = String::new();
            let read = timeout(deadline, stdout.read_line(&mut line))
                .await
                .map_err(|_| {
                    anyhow!("MCP server '{}' timed out on {method}", self.server_name)
                })??;
            if read == 0 {
                return Err(anyhow!(
                    "MCP server '{}' closed its pipe during {method}",
                    self.server_name
                ));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Ok(message) = serde_json::from_str::<Value>(trimmed) else {
                debug!("skipping non-JSON line from '{}'", self.server_name);
                continue;
            };
            if message.get("id").and_then(Value::as_i64) != Some(id) {
                continue;
            }

            if let Some(error) = message.get("error") {
                return Err(anyhow!(
                    "MCP server '{}' returned error on {method}: {error}",
                    self.server_name
                ));
            }
            return Ok(message.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolInfo>> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(tools
            .iter()
            .filter_map(|tool| {
                let name = tool.get("name")?.as_str()?.to_string();
                let description = tool
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let input_schema = tool
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({ "type": "object", "properties": {} }));
                Some(McpToolInfo {
                    name,
                    description,
                    input_schema,
                })
            })
            .collect())
    }

    /// Forward a tool invocation; relay text content back as one string.
    pub async fn call_tool(&self, name: &str, arguments: &Map<String, Value>) -> Result<String> {
        let result = self
            .request(
                "tools/call",
                json!({
                    "name": name,
                    "arguments": arguments,
                }),
            )
            .await?;

        let text = result
            .get("content")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        if result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            let detail = if text.is_empty() {
                "tool call failed".to_string()
            } else {
                text
            };
            return Ok(format!("Error: {detail}"));
        }
        if text.is_empty() {
            return Ok(serde_json::to_string(&result)?);
        }
        Ok(text)
    }

    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Err(err) = child.start_kill() {
            warn!(
                "error stopping MCP server '{}': {err}",
                self.server_name
            );
        }
        let _ = child.wait().await;
    }
}
