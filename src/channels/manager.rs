use crate::bus::MessageBus;
use crate::channels::base::Channel;
use crate::channels::telegram::TelegramChannel;
use crate::channels::whatsapp::WhatsAppChannel;
use crate::config::Config;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::error;

/// Builds the enabled adapters and runs the outbound dispatch task (the
/// single consumer of the outbound queue).
pub struct ChannelManager {
    bus: Arc<MessageBus>,
    channels: HashMap<String, Arc<dyn Channel>>,
    running: Arc<AtomicBool>,
    dispatch_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    channel_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ChannelManager {
    pub fn new(config: &Config, bus: Arc<MessageBus>) -> Self {
        let mut channels: HashMap<String, Arc<dyn Channel>> = HashMap::new();

        if config.channels.telegram.enabled {
            channels.insert(
                "telegram".to_string(),
                Arc::new(TelegramChannel::new(
                    config.channels.telegram.clone(),
                    bus.clone(),
                )),
            );
        }
        if config.channels.whatsapp.enabled {
            channels.insert(
                "whatsapp".to_string(),
                Arc::new(WhatsAppChannel::new(
                    config.channels.whatsapp.clone(),
                    bus.clone(),
                )),
            );
        }

        Self::from_channels(bus, channels)
    }

    pub(crate) fn from_channels(
        bus: Arc<MessageBus>,
        channels: HashMap<String, Arc<dyn Channel>>,
    ) -> Self {
        Self {
            bus,
            channels,
            running: Arc::new(AtomicBool::new(false)),
            dispatch_task: Mutex::new(None),
            channel_tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn enabled_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_channel(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.channels.get(name).cloned()
    }

    pub async fn start_all(&self) {
        if self.channels.is_empty() {
            return;
        }
        self.running.store(true, Ordering::Relaxed);

        let running = self.running.clone();
        let bus = self.bus.clone();
        let channels_for_dispatch = self.channels.clone();
        let dispatch = tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                let Some(msg) = bus.consume_outbound().await else {
                    break;
                };
                if let Some(channel) = channels_for_dispatch.get(&msg.channel) {
                    if let Err(err) = channel.send(&msg).await {
                        error!("failed to deliver to {}:{}: {err}", msg.channel, msg.chat_id);
                    }
                }
            }
        });
        *self.dispatch_task.lock().await = Some(dispatch);

        let mut tasks = self.channel_tasks.lock().await;
        for channel in self.channels.values() {
            let ch = channel.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = ch.start().await {
                    error!("channel {} stopped with error: {err}", ch.name());
                }
            }));
        }
        drop(tasks);

        while self.running.load(Ordering::Relaxed) {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }

    pub async fn stop_all(&self) {
        self.running.store(false, Ordering::Relaxed);
        for channel in self.channels.values() {
            let _ = channel.stop().await;
            channel.core().stop_all_typing().await;
        }

        if let Some(dispatch) = self.dispatch_task.lock().await.take() {
            dispatch.abort();
        }
        let mut tasks = self.channel_tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    pub fn get_status(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, channel) in &self.channels {
            map.insert(
                name.clone(),
                serde_json::json!({
                    "enabled": true,
                    "running": channel.is_running(),
                }),
            );
        }
        serde_json::Value::Object(map)
    }
}
