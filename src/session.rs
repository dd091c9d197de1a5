use crate::utils::{get_data_path, safe_filename, timestamp};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, warn};

/// One archived conversation record. Optional fields carry the OpenAI
/// wire shape for assistant tool calls and tool results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: String,
    pub content: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl SessionMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: timestamp(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            reasoning_content: None,
        }
    }

    /// Wire form for the provider: drop the timestamp, keep everything else.
    pub fn to_llm(&self) -> Value {
        let mut msg = json!({
            "role": self.role,
            "content": self.content,
        });
        if let Some(tool_calls) = &self.tool_calls {
            msg["tool_calls"] = tool_calls.clone();
        }
        if let Some(id) = &self.tool_call_id {
            msg["tool_call_id"] = Value::String(id.clone());
        }
        if let Some(name) = &self.name {
            msg["name"] = Value::String(name.clone());
        }
        if let Some(reasoning) = &self.reasoning_content {
            msg["reasoning_content"] = Value::String(reasoning.clone());
        }
        msg
    }
}

/// Append-only message archive for one conversation.
///
/// Compaction is encoded in the archive itself: a `system`-role record marks
/// the summary of everything before it, and `get_history` is the only place
/// that interprets it.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: String,
    pub messages: Vec<SessionMessage>,
    pub created_at: String,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            messages: Vec::new(),
            created_at: timestamp(),
        }
    }

    pub fn add_message(&mut self, role: &str, content: &str) {
        self.messages.push(SessionMessage::new(role, content));
    }

    pub fn add_message_full(
        &mut self,
        role: &str,
        content: &str,
        tool_calls: Option<Value>,
        tool_call_id: Option<String>,
        name: Option<String>,
        reasoning_content: Option<String>,
    ) {
        let mut msg = SessionMessage::new(role, content);
        msg.tool_calls = tool_calls;
        msg.tool_call_id = tool_call_id;
        msg.name = name;
        msg.reasoning_content = reasoning_content;
        self.messages.push(msg);
    }

    /// Compaction-aware view of the archive, in wire form.
    ///
    /// Scans backward for the most recent `system` record and returns it plus
    /// everything after, then caps to the last `max_messages` (0 = no cap).
    /// The raw archive is never touched.
    pub fn get_history(&self, max_messages: usize) -> Vec<Value> {
        let start = self
            .messages
            .iter()
            .rposition(|m| m.role == "system")
            .unwrap_or(0);
        let view = &self.messages[start..];

        let capped = if max_messages > 0 && view.len() > max_messages {
            &view[view.len() - max_messages..]
        } else {
            view
        };
        capped.iter().map(SessionMessage::to_llm).collect()
    }

    /// Empty the in-memory archive; persisted on the next `save`.
    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

pub struct SessionManager {
    sessions_dir: PathBuf,
    cache: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new() -> Result<Self> {
        let sessions_dir = get_data_path()?.join("sessions");
        Self::with_dir(sessions_dir)
    }

    pub fn with_dir(sessions_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&sessions_dir)?;
        Ok(Self {
            sessions_dir,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn session_path(&self, key: &str) -> PathBuf {
        let safe_key = safe_filename(&key.replace(':', "_"));
        self.sessions_dir.join(format!("{safe_key}.jsonl"))
    }

    /// Cache hit, else load from disk, else a fresh empty session.
    /// A corrupted file is logged and replaced by a fresh session.
    pub fn get_or_create(&self, key: &str) -> Session {
        if let Some(cached) = self.cache.lock().ok().and_then(|c| c.get(key).cloned()) {
            return cached;
        }

        let loaded = match self.load(key) {
            Ok(session) => session,
            Err(err) => {
                if self.session_path(key).exists() {
                    error!("failed to load session {key}: {err}; starting fresh");
                }
                Session::new(key)
            }
        };
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key.to_string(), loaded.clone());
        }
        loaded
    }

    /// Rewrite the session file: metadata line followed by one message per
    /// line, UTF-8 without ASCII escaping.
    pub fn save(&self, session: &Session) -> Result<()> {
        let path = self.session_path(&session.key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut lines = Vec::with_capacity(session.messages.len() + 1);
        lines.push(serde_json::to_string(&json!({
            "_type": "metadata",
            "key": session.key,
            "createdAt": session.created_at,
        }))?);
        for msg in &session.messages {
            lines.push(serde_json::to_string(msg)?);
        }
        std::fs::write(&path, format!("{}\n", lines.join("\n")))?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(session.key.clone(), session.clone());
        }
        Ok(())
    }

    /// Drop a key from the cache without touching the file.
    pub fn invalidate(&self, key: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(key);
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        self.invalidate(key);
        let path = self.session_path(key);
        if path.exists() {
            std::fs::remove_file(path).is_ok()
        } else {
            false
        }
    }

    /// Session keys as recorded in the metadata line of each archive.
    pub fn list_sessions(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.sessions_dir) else {
            return Vec::new();
        };
        let mut keys = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Some(first) = content.lines().next() else {
                continue;
            };
            match serde_json::from_str::<Value>(first) {
                Ok(meta) if meta.get("_type").and_then(Value::as_str) == Some("metadata") => {
                    if let Some(key) = meta.get("key").and_then(Value::as_str) {
                        keys.push(key.to_string());
                    }
                }
                _ => warn!("session file without metadata line: {}", path.display()),
            }
        }
        keys.sort();
        keys
    }

    /// Read-only load that bypasses the cache.
    pub fn load_session(&self, key: &str) -> Result<Session> {
        self.load(key)
    }

    fn load(&self, key: &str) -> Result<Session> {
        let path = self.session_path(key);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed reading {}", path.display()))?;

        let mut session = Session::new(key);
        for line in content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
        {
            let value: Value = serde_json::from_str(line)
                .with_context(|| format!("corrupted record in {}", path.display()))?;
            if value.get("_type").and_then(Value::as_str) == Some("metadata") {
                if let Some(created) = value.get("createdAt").and_then(Value::as_str) {
                    session.created_at = created.to_string();
                }
            } else {
                let msg: SessionMessage = serde_json::from_value(value)
                    .with_context(|| format!("corrupted message in {}", path.display()))?;
                session.messages.push(msg);
            }
        }
        Ok(session)
    }
}
