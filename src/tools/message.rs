use crate::bus::OutboundMessage;
use crate::tools::base::Tool;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

#[derive(Default)]
struct MessageContext {
    channel: String,
    chat_id: String,
}

/// Sends a message to a chat channel mid-turn. Tracks whether it fired so
/// the agent loop can skip its fallback reply and the user gets exactly
/// one answer.
pub struct MessageTool {
    sender: mpsc::UnboundedSender<OutboundMessage>,
    context: Mutex<MessageContext>,
    sent_in_turn: AtomicBool,
}

impl MessageTool {
    pub fn new(sender: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self {
            sender,
            context: Mutex::new(MessageContext::default()),
            sent_in_turn: AtomicBool::new(false),
        }
    }

    pub fn set_context(&self, channel: impl Into<String>, chat_id: impl Into<String>) {
        if let Ok(mut guard) = self.context.lock() {
            guard.channel = channel.into();
            guard.chat_id = chat_id.into();
        }
    }

    /// Reset per-turn send tracking. Called at the top of every turn.
    pub fn start_turn(&self) {
        self.sent_in_turn.store(false, Ordering::Relaxed);
    }

    pub fn sent_in_turn(&self) -> bool {
        self.sent_in_turn.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to the user on a chat channel. Use this for proactive updates; normal replies should be plain text."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "The message content to send" },
                "channel": { "type": "string", "description": "Optional target channel" },
                "chat_id": { "type": "string", "description": "Optional target chat/user ID" }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<String> {
        let content = params
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing required string field: content"))?;

        let explicit_channel = params
            .get("channel")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned);
        let explicit_chat_id = params
            .get("chat_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned);

        let (channel, chat_id) = {
            let guard = self
                .context
                .lock()
                .map_err(|_| anyhow!("failed to lock message tool context"))?;
            (
                explicit_channel.unwrap_or_else(|| guard.channel.clone()),
                explicit_chat_id.unwrap_or_else(|| guard.chat_id.clone()),
            )
        };

        if channel.is_empty() || chat_id.is_empty() {
            return Ok("Error: No target channel/chat specified".to_string());
        }

        let msg = OutboundMessage::new(channel.clone(), chat_id.clone(), content);
        self.sender
            .send(msg)
            .map_err(|err| anyhow!("Error sending message: {err}"))?;
        self.sent_in_turn.store(true, Ordering::Relaxed);

        Ok(format!("Message sent to {channel}:{chat_id}"))
    }
}
