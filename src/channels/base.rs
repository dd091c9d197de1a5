use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use crate::utils::{ensure_dir, get_data_path, safe_filename};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

/// Allow-list check shared by every adapter. An empty list admits
/// everyone; compound ids like `12345|username` match on any part.
pub fn is_allowed_sender(sender_id: &str, allow_from: &[String]) -> bool {
    if allow_from.is_empty() {
        return true;
    }
    if allow_from.iter().any(|allowed| allowed == sender_id) {
        return true;
    }
    if sender_id.contains('|') {
        return sender_id
            .split('|')
            .filter(|part| !part.is_empty())
            .any(|part| allow_from.iter().any(|allowed| allowed == part));
    }
    false
}

/// State every adapter embeds: the bus handle, the running flag, and the
/// per-chat typing-indicator tasks (always cancelled before a send and on
/// shutdown).
pub struct ChannelCore {
    name: String,
    bus: Arc<MessageBus>,
    running: AtomicBool,
    typing_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ChannelCore {
    pub fn new(name: impl Into<String>, bus: Arc<MessageBus>) -> Self {
        Self {
            name: name.into(),
            bus,
            running: AtomicBool::new(false),
            typing_tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        self.bus.clone()
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Register a typing task for a chat, cancelling any previous one.
    pub async fn start_typing(&self, chat_id: &str, task: JoinHandle<()>) {
        let mut tasks = self.typing_tasks.lock().await;
        if let Some(previous) = tasks.insert(chat_id.to_string(), task) {
            previous.abort();
        }
    }

    pub async fn stop_typing(&self, chat_id: &str) {
        if let Some(task) = self.typing_tasks.lock().await.remove(chat_id) {
            task.abort();
        }
    }

    pub async fn stop_all_typing(&self) {
        let mut tasks = self.typing_tasks.lock().await;
        for (_, task) in tasks.drain() {
            task.abort();
        }
    }

    /// Save downloaded media under the per-channel media directory with a
    /// sanitized, id-prefixed filename. Returns the saved path.
    pub async fn save_media(
        &self,
        data: &[u8],
        filename: &str,
        file_id: Option<&str>,
    ) -> Result<PathBuf> {
        let media_dir = ensure_dir(&get_data_path()?.join("media").join(&self.name))?;
        let mut safe_name = safe_filename(filename);
        if let Some(file_id) = file_id {
            let prefix: String = file_id.chars().take(16).collect();
            safe_name = format!("{}_{safe_name}", safe_filename(&prefix));
        }
        let path = media_dir.join(safe_name);
        tokio::fs::write(&path, data).await?;
        Ok(path)
    }
}

/// A chat platform adapter. Implementations provide `start`, `stop` and
/// `send_impl`; permission checks, typing cleanup, and empty-message
/// rejection are shared behavior.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;
    fn core(&self) -> &ChannelCore;
    fn allow_from(&self) -> &[String];

    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn send_impl(&self, msg: &OutboundMessage) -> Result<()>;

    fn is_running(&self) -> bool {
        self.core().is_running()
    }

    fn is_allowed(&self, sender_id: &str) -> bool {
        is_allowed_sender(sender_id, self.allow_from())
    }

    /// Single send entry: stop the chat's typing indicator, drop blank
    /// content, then hand off to the platform implementation.
    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        self.core().stop_typing(&msg.chat_id).await;
        if msg.content.trim().is_empty() {
            warn!(
                "skipping empty message to {} on {}",
                msg.chat_id,
                self.name()
            );
            return Ok(());
        }
        self.send_impl(msg).await
    }

    /// Ingress path: allow-list check, then publish to the bus.
    async fn handle_message(
        &self,
        sender_id: String,
        chat_id: String,
        content: String,
        media: Vec<String>,
        metadata: Map<String, Value>,
    ) -> Result<()> {
        if !self.is_allowed(&sender_id) {
            warn!(
                "access denied for sender {sender_id} on channel {}; add them to allowFrom to grant access",
                self.name()
            );
            return Ok(());
        }
        let mut msg = InboundMessage::new(self.name(), sender_id, chat_id, content);
        msg.media = media;
        msg.metadata = metadata;
        self.core().bus().publish_inbound(msg)?;
        Ok(())
    }
}
