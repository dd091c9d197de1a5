pub mod client;

use crate::config::McpServerConfig;
use crate::tools::ToolRegistry;
use crate::tools::mcp::McpTool;
use client::McpClient;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// Owns every configured MCP server subprocess. Connection is lazy (first
/// inbound message); a failed attempt is retried on the next message, and
/// shutdown tears all children down through this single scope.
pub struct McpManager {
    servers: HashMap<String, McpServerConfig>,
    clients: Mutex<Vec<Arc<McpClient>>>,
    connected_names: Mutex<HashSet<String>>,
    connected: AtomicBool,
    connecting: AtomicBool,
}

impl McpManager {
    pub fn new(servers: HashMap<String, McpServerConfig>) -> Self {
        Self {
            servers,
            clients: Mutex::new(Vec::new()),
            connected_names: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.servers.is_empty()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Connect every configured server that is not connected yet and
    /// register its tools. Idempotent; concurrent calls collapse into one
    /// attempt.
    pub async fn connect_all(&self, registry: &RwLock<ToolRegistry>) {
        if !self.is_configured()
            || self.connected.load(Ordering::Relaxed)
            || self.connecting.swap(true, Ordering::Relaxed)
        {
            return;
        }

        let mut all_ok = true;
        for (name, config) in &self.servers {
            if self.connected_names.lock().await.contains(name) {
                continue;
            }
            match self.connect_one(name, config, registry).await {
                Ok(client) => {
                    self.clients.lock().await.push(client);
                    self.connected_names.lock().await.insert(name.clone());
                    info!("connected MCP server '{name}'");
                }
                Err(err) => {
                    error!("failed to connect MCP server '{name}' (will retry next message): {err}");
                    all_ok = false;
                }
            }
        }

        if all_ok {
            self.connected.store(true, Ordering::Relaxed);
        }
        self.connecting.store(false, Ordering::Relaxed);
    }

    async fn connect_one(
        &self,
        name: &str,
        config: &McpServerConfig,
        registry: &RwLock<ToolRegistry>,
    ) -> anyhow::Result<Arc<McpClient>> {
        let client = Arc::new(McpClient::connect(name, config).await?);
        match client.list_tools().await {
            Ok(tools) => {
                let mut registry = registry.write().await;
                for tool in tools {
                    registry.register(Arc::new(McpTool::new(client.clone(), tool)));
                }
                Ok(client)
            }
            Err(err) => {
                client.shutdown().await;
                Err(err)
            }
        }
    }

    /// Kill every child process. Cleanup errors are swallowed; they are
    /// frequently noisy but harmless on shutdown.
    pub async fn shutdown(&self) {
        let mut clients = self.clients.lock().await;
        for client in clients.drain(..) {
            client.shutdown().await;
        }
        self.connected_names.lock().await.clear();
        self.connected.store(false, Ordering::Relaxed);
        if self.is_configured() {
            warn!("MCP servers stopped");
        }
    }
}
