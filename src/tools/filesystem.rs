use crate::tools::base::Tool;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use similar::TextDiff;
use std::path::{Component, Path, PathBuf};

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

/// Resolve symlinks in the deepest existing ancestor, then re-attach the
/// non-existent tail. Keeps the prefix check meaningful for paths that are
/// about to be created.
fn resolve_symlinks(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut tail = Vec::new();
    loop {
        if existing.exists() {
            break;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return lexical_normalize(path),
        }
    }
    let mut resolved = existing
        .canonicalize()
        .unwrap_or_else(|_| lexical_normalize(existing));
    for name in tail.iter().rev() {
        resolved.push(name);
    }
    resolved
}

/// Shared path policy for all filesystem tools: tildes expand, relative
/// paths land in the workspace, and with `allowed_dir` set the resolved
/// target must stay inside it (symlink escapes blocked by resolving first).
fn resolve_path(
    path: &str,
    workspace: Option<&Path>,
    allowed_dir: Option<&Path>,
) -> Result<PathBuf> {
    let expanded = crate::utils::expand_tilde(path);
    let absolute = if expanded.is_absolute() {
        expanded
    } else if let Some(workspace) = workspace {
        workspace.join(expanded)
    } else {
        std::env::current_dir()?.join(expanded)
    };
    let resolved = resolve_symlinks(&lexical_normalize(&absolute));

    if let Some(allowed) = allowed_dir {
        let allowed = allowed
            .canonicalize()
            .unwrap_or_else(|_| lexical_normalize(allowed));
        if !resolved.starts_with(&allowed) {
            return Err(anyhow!(
                "Path {path} is outside allowed directory {}",
                allowed.display()
            ));
        }
    }
    Ok(resolved)
}

fn required_str<'a>(params: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing required string field: {key}"))
}

pub struct ReadFileTool {
    workspace: Option<PathBuf>,
    allowed_dir: Option<PathBuf>,
}

impl ReadFileTool {
    pub fn new(workspace: Option<PathBuf>, allowed_dir: Option<PathBuf>) -> Self {
        Self {
            workspace,
            allowed_dir,
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file at the given path."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "The file path to read" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<String> {
        let path = required_str(params, "path")?;
        let resolved = match resolve_path(path, self.workspace.as_deref(), self.allowed_dir.as_deref())
        {
            Ok(p) => p,
            Err(err) => return Ok(format!("Error: {err}")),
        };

        if !resolved.exists() {
            return Ok(format!("Error: File not found: {path}"));
        }
        if !resolved.is_file() {
            return Ok(format!("Error: Not a file: {path}"));
        }
        Ok(tokio::fs::read_to_string(&resolved).await?)
    }
}

pub struct WriteFileTool {
    workspace: Option<PathBuf>,
    allowed_dir: Option<PathBuf>,
}

impl WriteFileTool {
    pub fn new(workspace: Option<PathBuf>, allowed_dir: Option<PathBuf>) -> Self {
        Self {
            workspace,
            allowed_dir,
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file at the given path. Creates parent directories if needed."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "The file path to write to" },
                "content": { "type": "string", "description": "The content to write" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<String> {
        let path = required_str(params, "path")?;
        let content = required_str(params, "content")?;
        let resolved = match resolve_path(path, self.workspace.as_deref(), self.allowed_dir.as_deref())
        {
            Ok(p) => p,
            Err(err) => return Ok(format!("Error: {err}")),
        };

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Atomic overwrite: write to a sibling temp file, then rename.
        let tmp = resolved.with_extension("nightowl.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &resolved).await?;
        Ok(format!(
            "Successfully wrote {} bytes to {path}",
            content.len()
        ))
    }
}

pub struct EditFileTool {
    workspace: Option<PathBuf>,
    allowed_dir: Option<PathBuf>,
}

impl EditFileTool {
    pub fn new(workspace: Option<PathBuf>, allowed_dir: Option<PathBuf>) -> Self {
        Self {
            workspace,
            allowed_dir,
        }
    }

    /// Build a diff hint against the closest window of the file, so the
    /// model can see how its `old_text` drifted from the actual content.
    fn not_found_message(old_text: &str, content: &str, path: &str) -> String {
        let lines: Vec<&str> = content.lines().collect();
        let old_lines: Vec<&str> = old_text.lines().collect();
        let window = old_lines.len().max(1);

        let mut best_ratio = 0.0f32;
        let mut best_start = 0usize;
        let last_start = lines.len().saturating_sub(window);
        for start in 0..=last_start {
            let candidate = lines[start..(start + window).min(lines.len())].join("\n");
            // Character-granular ratio: line-granular scoring would rank
            // every near-miss single line at zero.
            let ratio = TextDiff::from_chars(old_text, candidate.as_str()).ratio();
            if ratio > best_ratio {
                best_ratio = ratio;
                best_start = start;
            }
        }

        if best_ratio > 0.5 {
            let candidate = lines[best_start..(best_start + window).min(lines.len())].join("\n");
            let diff = TextDiff::from_lines(old_text, candidate.as_str());
            let rendered = diff
                .unified_diff()
                .header(
                    "old_text (provided)",
                    &format!("{path} (actual, line {})", best_start + 1),
                )
                .to_string();
            format!(
                "Error: old_text not found in {path}.\nBest match ({:.0}% similar) at line {}:\n{rendered}",
                best_ratio * 100.0,
                best_start + 1
            )
        } else {
            format!("Error: old_text not found in {path}. No similar text found. Verify the file content.")
        }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing old_text with new_text. old_text must appear exactly once."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "The file path to edit" },
                "old_text": { "type": "string", "description": "The exact text to find and replace" },
                "new_text": { "type": "string", "description": "The replacement text" }
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<String> {
        let path = required_str(params, "path")?;
        let old_text = required_str(params, "old_text")?;
        let new_text = required_str(params, "new_text")?;
        let resolved = match resolve_path(path, self.workspace.as_deref(), self.allowed_dir.as_deref())
        {
            Ok(p) => p,
            Err(err) => return Ok(format!("Error: {err}")),
        };

        if !resolved.exists() {
            return Ok(format!("Error: File not found: {path}"));
        }

        let content = tokio::fs::read_to_string(&resolved).await?;
        let count = content.matches(old_text).count();
        if count == 0 {
            return Ok(Self::not_found_message(old_text, &content, path));
        }
        if count > 1 {
            return Ok(format!(
                "Warning: old_text appears {count} times. Please provide more context to make it unique."
            ));
        }

        let updated = content.replacen(old_text, new_text, 1);
        tokio::fs::write(&resolved, updated).await?;
        Ok(format!("Successfully edited {path}"))
    }
}

pub struct ListDirTool {
    workspace: Option<PathBuf>,
    allowed_dir: Option<PathBuf>,
}

impl ListDirTool {
    pub fn new(workspace: Option<PathBuf>, allowed_dir: Option<PathBuf>) -> Self {
        Self {
            workspace,
            allowed_dir,
        }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the contents of a directory."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "The directory path to list" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<String> {
        let path = required_str(params, "path")?;
        let resolved = match resolve_path(path, self.workspace.as_deref(), self.allowed_dir.as_deref())
        {
            Ok(p) => p,
            Err(err) => return Ok(format!("Error: {err}")),
        };

        if !resolved.exists() {
            return Ok(format!("Error: Directory not found: {path}"));
        }
        if !resolved.is_dir() {
            return Ok(format!("Error: Not a directory: {path}"));
        }

        let mut entries = tokio::fs::read_dir(&resolved).await?;
        let mut items = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            let prefix = if metadata.is_dir() { "[DIR]" } else { "[FILE]" };
            items.push(format!("{prefix} {}", entry.file_name().to_string_lossy()));
        }
        items.sort();

        if items.is_empty() {
            Ok(format!("Directory {path} is empty"))
        } else {
            Ok(items.join("\n"))
        }
    }
}
