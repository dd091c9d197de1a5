use futures_util::future::BoxFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const DEFAULT_HEARTBEAT_INTERVAL_S: u64 = 30 * 60;
pub const HEARTBEAT_PROMPT: &str = "Read the heartbeat file in your workspace (HEARTBEAT.toml or HEARTBEAT.md).\nFollow any instructions or tasks listed there.\nIf nothing needs attention, reply with just: HEARTBEAT_OK";
pub const HEARTBEAT_OK_TOKEN: &str = "HEARTBEAT_OK";

pub type HeartbeatCallback = Arc<dyn Fn(String) -> BoxFuture<'static, String> + Send + Sync>;

/// Markdown heartbeat content with no actionable line: blanks, headers,
/// HTML comments and bare checkbox skeletons don't count.
pub fn is_heartbeat_empty(content: Option<&str>) -> bool {
    let Some(content) = content else {
        return true;
    };
    let skip_patterns = ["- [ ]", "* [ ]", "- [x]", "* [x]"];
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty()
            || line.starts_with('#')
            || line.starts_with("<!--")
            || skip_patterns.contains(&line)
        {
            continue;
        }
        return false;
    }
    true
}

fn toml_value_has_tasks(value: &toml::Value) -> bool {
    match value {
        toml::Value::String(s) => !s.trim().is_empty(),
        toml::Value::Array(items) => !items.is_empty(),
        toml::Value::Boolean(b) => *b,
        toml::Value::Table(table) => table.values().any(toml_value_has_tasks),
        _ => false,
    }
}

/// TOML heartbeat content is actionable when any section carries a
/// non-empty task entry; unparseable content is treated as empty.
pub fn is_heartbeat_toml_empty(content: Option<&str>) -> bool {
    let Some(content) = content else {
        return true;
    };
    match content.parse::<toml::Table>() {
        Ok(table) => !table.values().any(toml_value_has_tasks),
        Err(_) => true,
    }
}

/// The agent's reply counts as an idle acknowledgement regardless of case
/// or underscores.
pub fn is_heartbeat_ok(response: &str) -> bool {
    let normalized = response.to_uppercase().replace('_', "");
    normalized.contains(&HEARTBEAT_OK_TOKEN.to_uppercase().replace('_', ""))
}

/// Periodic self-poke: every `interval_s`, read the workspace heartbeat
/// file and hand the agent the fixed prompt when it holds actionable work.
pub struct HeartbeatService {
    workspace: PathBuf,
    on_heartbeat: Arc<Mutex<Option<HeartbeatCallback>>>,
    interval_s: u64,
    enabled: bool,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatService {
    pub fn new(workspace: PathBuf, interval_s: u64, enabled: bool) -> Self {
        Self {
            workspace,
            on_heartbeat: Arc::new(Mutex::new(None)),
            interval_s,
            enabled,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub async fn set_on_heartbeat(&self, callback: HeartbeatCallback) {
        *self.on_heartbeat.lock().await = Some(callback);
    }

    /// `HEARTBEAT.toml` wins when both exist.
    pub fn heartbeat_file(&self) -> PathBuf {
        let toml_file = self.workspace.join("HEARTBEAT.toml");
        if toml_file.exists() {
            toml_file
        } else {
            self.workspace.join("HEARTBEAT.md")
        }
    }

    async fn has_actionable_content(&self) -> bool {
        let path = self.heartbeat_file();
        let content = tokio::fs::read_to_string(&path).await.ok();
        if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            !is_heartbeat_toml_empty(content.as_deref())
        } else {
            !is_heartbeat_empty(content.as_deref())
        }
    }

    /// One heartbeat check. Public so tests and manual triggers share the
    /// exact scheduling path.
    pub async fn tick(&self) {
        if !self.has_actionable_content().await {
            debug!("heartbeat skipped: no actionable content");
            return;
        }

        let callback = self.on_heartbeat.lock().await.clone();
        if let Some(callback) = callback {
            let response = callback(HEARTBEAT_PROMPT.to_string()).await;
            if is_heartbeat_ok(&response) {
                debug!("heartbeat acknowledged with no work");
            }
        }
    }

    pub async fn start(&self) {
        if !self.enabled {
            return;
        }
        self.running.store(true, Ordering::Relaxed);
        let running = self.running.clone();
        let on_heartbeat = self.on_heartbeat.clone();
        let workspace = self.workspace.clone();
        let interval_s = self.interval_s;

        let handle = tokio::spawn(async move {
            let service = HeartbeatService {
                workspace,
                on_heartbeat,
                interval_s,
                enabled: true,
                running: running.clone(),
                task: Mutex::new(None),
            };
            while running.load(Ordering::Relaxed) {
                tokio::time::sleep(std::time::Duration::from_secs(interval_s)).await;
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                service.tick().await;
            }
        });
        *self.task.lock().await = Some(handle);
        info!("heartbeat service started (every {}s)", self.interval_s);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }

    /// Run the callback immediately, skipping the actionable-content gate.
    pub async fn trigger_now(&self) -> Option<String> {
        let callback = self.on_heartbeat.lock().await.clone();
        match callback {
            Some(callback) => Some(callback(HEARTBEAT_PROMPT.to_string()).await),
            None => None,
        }
    }
}
