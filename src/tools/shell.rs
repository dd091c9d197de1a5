use crate::tools::base::Tool;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::path::{Component, Path, PathBuf};
use tokio::process::Command;
use tokio::time::{Duration, timeout};

const MAX_OUTPUT_CHARS: usize = 10_000;

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Shell execution with a subprocess-level timeout. When
/// `restrict_to_workspace` is set, the working directory is forced to the
/// workspace and commands referencing paths outside it are rejected.
pub struct ExecTool {
    timeout_s: u64,
    working_dir: Option<PathBuf>,
    deny_patterns: Vec<String>,
    restrict_to_workspace: bool,
}

impl ExecTool {
    pub fn new(
        timeout_s: u64,
        working_dir: Option<PathBuf>,
        deny_patterns: Option<Vec<String>>,
        restrict_to_workspace: bool,
    ) -> Self {
        Self {
            timeout_s,
            working_dir,
            deny_patterns: deny_patterns.unwrap_or_else(|| {
                vec![
                    r"\brm\s+-[rf]{1,2}\b",
                    r"\bdel\s+/[fq]\b",
                    r"\brmdir\s+/s\b",
                    r"\b(format|mkfs|diskpart)\b",
                    r"\bdd\s+if=",
                    r">\s*/dev/sd",
                    r"\b(shutdown|reboot|poweroff)\b",
                    r":\(\)\s*\{.*\};\s*:",
                ]
                .into_iter()
                .map(str::to_string)
                .collect()
            }),
            restrict_to_workspace,
        }
    }

    fn guard_command(&self, command: &str, cwd: &Path) -> Option<String> {
        let trimmed = command.trim();
        let lower = trimmed.to_lowercase();

        for pattern in &self.deny_patterns {
            if let Ok(re) = Regex::new(pattern)
                && re.is_match(&lower)
            {
                return Some(
                    "Error: Command blocked by safety guard (dangerous pattern detected)"
                        .to_string(),
                );
            }
        }

        if self.restrict_to_workspace {
            if lower.contains("../") || lower.contains("..\\") {
                return Some(
                    "Error: Command blocked by safety guard (path traversal detected)".to_string(),
                );
            }

            let cwd = lexical_normalize(cwd);
            let absolute_paths = Regex::new(r#"/[^\s"']+"#)
                .map(|re| {
                    re.find_iter(trimmed)
                        .map(|m| m.as_str().to_string())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            for raw in absolute_paths {
                let p = lexical_normalize(Path::new(&raw));
                if !p.starts_with(&cwd) && p != cwd {
                    return Some(
                        "Error: Command blocked by safety guard (path outside working dir)"
                            .to_string(),
                    );
                }
            }
        }

        None
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its output. Use with caution."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "The shell command to execute" },
                "working_dir": { "type": "string", "description": "Optional working directory for the command" }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<String> {
        let command = params
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing required string field: command"))?;

        let cwd = if self.restrict_to_workspace {
            // Workspace restriction pins the working directory regardless
            // of what the model asked for.
            self.working_dir
                .clone()
                .unwrap_or(std::env::current_dir()?)
        } else {
            params
                .get("working_dir")
                .and_then(Value::as_str)
                .map(PathBuf::from)
                .or_else(|| self.working_dir.clone())
                .unwrap_or(std::env::current_dir()?)
        };

        if let Some(err) = self.guard_command(command, &cwd) {
            return Ok(err);
        }

        let mut process = if cfg!(target_os = "windows") {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", command]);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", command]);
            cmd
        };
        process.current_dir(&cwd);

        let output = match timeout(Duration::from_secs(self.timeout_s), process.output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Ok(format!(
                    "Error: Command timed out after {} seconds",
                    self.timeout_s
                ));
            }
        };

        let mut parts = Vec::new();
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !stdout.is_empty() {
            parts.push(stdout);
        }
        if !stderr.trim().is_empty() {
            parts.push(format!("STDERR:\n{stderr}"));
        }
        if !output.status.success() {
            parts.push(format!(
                "\nExit code: {}",
                output.status.code().unwrap_or(-1)
            ));
        }

        let mut result = if parts.is_empty() {
            "(no output)".to_string()
        } else {
            parts.join("\n")
        };
        if result.len() > MAX_OUTPUT_CHARS {
            let head: String = result.chars().take(MAX_OUTPUT_CHARS).collect();
            let dropped = result.len() - head.len();
            result = format!("{head}\n... (truncated, {dropped} more chars)");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn temp_workspace() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nightowl-exec-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_captures_stdout() {
        let tool = ExecTool::new(10, None, None, false);
        let result = tool
            .execute(&args(json!({ "command": "echo hello" })))
            .await
            .expect("exec");
        assert!(result.contains("hello"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_reports_exit_code() {
        let tool = ExecTool::new(10, None, None, false);
        let result = tool
            .execute(&args(json!({ "command": "exit 3" })))
            .await
            .expect("exec");
        assert!(result.contains("Exit code: 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_times_out() {
        let tool = ExecTool::new(1, None, None, false);
        let result = tool
            .execute(&args(json!({ "command": "sleep 5" })))
            .await
            .expect("exec");
        assert!(result.contains("timed out after 1 seconds"));
    }

    #[tokio::test]
    async fn deny_pattern_blocks_destructive_commands() {
        let tool = ExecTool::new(10, None, None, false);
        let result = tool
            .execute(&args(json!({ "command": "rm -rf /" })))
            .await
            .expect("exec");
        assert!(result.contains("blocked by safety guard"));
    }

    #[tokio::test]
    async fn restriction_blocks_traversal_and_outside_paths() {
        let ws = temp_workspace();
        let tool = ExecTool::new(10, Some(ws.clone()), None, true);

        let result = tool
            .execute(&args(json!({ "command": "cat ../secret" })))
            .await
            .expect("exec");
        assert!(result.contains("path traversal"));

        let result = tool
            .execute(&args(json!({ "command": "cat /etc/passwd" })))
            .await
            .expect("exec");
        assert!(result.contains("path outside working dir"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn restriction_forces_workspace_cwd() {
        let ws = temp_workspace();
        let canonical = ws.canonicalize().expect("canonicalize");
        let tool = ExecTool::new(10, Some(canonical.clone()), None, true);
        let result = tool
            .execute(&args(json!({ "command": "pwd", "working_dir": "/" })))
            .await
            .expect("exec");
        assert!(result.trim_end().ends_with(
            canonical
                .file_name()
                .and_then(|n| n.to_str())
                .expect("name")
        ));
    }
}
