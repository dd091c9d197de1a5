use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc};

/// A message arriving from a channel adapter (or a scheduler, when
/// `channel == "system"`; those encode their origin in `chat_id` as
/// `origin_channel:origin_chat_id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    pub timestamp: DateTime<Local>,
    pub media: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            timestamp: Local::now(),
            media: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    pub reply_to: Option<String>,
    pub media: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl OutboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            reply_to: None,
            media: Vec::new(),
            metadata: Map::new(),
        }
    }
}

/// Two unbounded FIFO queues decoupling channel adapters from the agent.
///
/// Exactly one consumer per direction: the agent loop drains `inbound`,
/// the channel dispatcher drains `outbound`.
pub struct MessageBus {
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: Mutex<mpsc::UnboundedReceiver<OutboundMessage>>,
    inbound_size: AtomicUsize,
    outbound_size: AtomicUsize,
}

impl MessageBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
            inbound_size: AtomicUsize::new(0),
            outbound_size: AtomicUsize::new(0),
        }
    }

    pub fn outbound_sender(&self) -> mpsc::UnboundedSender<OutboundMessage> {
        self.outbound_tx.clone()
    }

    pub fn publish_inbound(&self, msg: InboundMessage) -> anyhow::Result<()> {
        self.inbound_size.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.inbound_tx.send(msg) {
            self.inbound_size.fetch_sub(1, Ordering::Relaxed);
            return Err(anyhow::anyhow!("failed to publish inbound message: {err}"));
        }
        Ok(())
    }

    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        let msg = rx.recv().await;
        if msg.is_some() {
            self.inbound_size.fetch_sub(1, Ordering::Relaxed);
        }
        msg
    }

    pub fn publish_outbound(&self, msg: OutboundMessage) -> anyhow::Result<()> {
        self.outbound_size.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.outbound_tx.send(msg) {
            self.outbound_size.fetch_sub(1, Ordering::Relaxed);
            return Err(anyhow::anyhow!("failed to publish outbound message: {err}"));
        }
        Ok(())
    }

    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        let mut rx = self.outbound_rx.lock().await;
        let msg = rx.recv().await;
        if msg.is_some() {
            self.outbound_size.fetch_sub(1, Ordering::Relaxed);
        }
        msg
    }

    pub fn inbound_size(&self) -> usize {
        self.inbound_size.load(Ordering::Relaxed)
    }

    pub fn outbound_size(&self) -> usize {
        self.outbound_size.load(Ordering::Relaxed)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_joins_channel_and_chat() {
        let msg = InboundMessage::new("telegram", "42", "1001", "hi");
        assert_eq!(msg.session_key(), "telegram:1001");
    }

    #[tokio::test]
    async fn inbound_queue_is_fifo() {
        let bus = MessageBus::new();
        for i in 0..5 {
            bus.publish_inbound(InboundMessage::new("cli", "user", "a", format!("m{i}")))
                .expect("publish");
        }
        for i in 0..5 {
            let msg = bus.consume_inbound().await.expect("message");
            assert_eq!(msg.content, format!("m{i}"));
        }
        assert_eq!(bus.inbound_size(), 0);
    }

    #[tokio::test]
    async fn outbound_queue_is_fifo_and_counted() {
        let bus = MessageBus::new();
        bus.publish_outbound(OutboundMessage::new("cli", "a", "one"))
            .expect("publish");
        bus.publish_outbound(OutboundMessage::new("cli", "a", "two"))
            .expect("publish");
        assert_eq!(bus.outbound_size(), 2);
        assert_eq!(bus.consume_outbound().await.expect("msg").content, "one");
        assert_eq!(bus.consume_outbound().await.expect("msg").content, "two");
    }
}
