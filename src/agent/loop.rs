use crate::agent::context::ContextManager;
use crate::agent::subagent::SubagentManager;
use crate::agent::summarizer::Summarizer;
use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use crate::cron::CronService;
use crate::mcp::McpManager;
use crate::providers::LLMProvider;
use crate::session::SessionManager;
use crate::tools::ToolRegistry;
use crate::tools::cron::CronTool;
use crate::tools::filesystem::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use crate::tools::memory::MemoryTool;
use crate::tools::message::MessageTool;
use crate::tools::shell::ExecTool;
use crate::tools::spawn::SpawnTool;
use crate::tools::web::{WebFetchTool, WebSearchTool};
use crate::utils::truncate_string;
use crate::vector_memory::VectorMemory;
use anyhow::Result;
use futures_util::future::BoxFuture;
use regex::Regex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tokio::time::{Duration, timeout};
use tracing::{error, info, warn};

pub type ProgressFn = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Tunables shared by the gateway and the CLI entrypoints.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub model: Option<String>,
    pub summarizer_model: Option<String>,
    pub max_iterations: u32,
    pub memory_window: usize,
    pub llm_timeout_s: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    pub web_search_key: Option<String>,
    pub exec_timeout_s: u64,
    pub restrict_to_workspace: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: None,
            summarizer_model: None,
            max_iterations: 20,
            memory_window: 50,
            llm_timeout_s: 60,
            max_tokens: 8192,
            temperature: 0.7,
            web_search_key: None,
            exec_timeout_s: 60,
            restrict_to_workspace: false,
        }
    }
}

/// The core processing engine: single consumer of the inbound queue.
///
/// Per message it builds context (history, identity, memory, skills),
/// runs the reason-act cycle against the provider, executes tool calls,
/// and publishes at most one reply.
pub struct AgentLoop {
    bus: Arc<MessageBus>,
    provider: Arc<dyn LLMProvider>,
    workspace: PathBuf,
    model: String,
    max_iterations: u32,
    memory_window: usize,
    llm_timeout_s: u64,
    max_tokens: u32,
    temperature: f32,
    context: ContextManager,
    sessions: Arc<SessionManager>,
    tools: RwLock<ToolRegistry>,
    message_tool: Arc<MessageTool>,
    spawn_tool: Arc<SpawnTool>,
    cron_tool: Option<Arc<CronTool>>,
    subagents: Arc<SubagentManager>,
    mcp: Arc<McpManager>,
    running: AtomicBool,
}

impl AgentLoop {
    pub fn new(
        bus: Arc<MessageBus>,
        provider: Arc<dyn LLMProvider>,
        workspace: PathBuf,
        settings: AgentSettings,
        cron_service: Option<Arc<CronService>>,
        session_manager: Option<Arc<SessionManager>>,
        vector_memory: Option<Arc<dyn VectorMemory>>,
        mcp: Arc<McpManager>,
    ) -> Result<Self> {
        let model = settings
            .model
            .clone()
            .unwrap_or_else(|| provider.default_model().to_string());

        let summarizer = Arc::new(Summarizer::new(
            provider.clone(),
            settings.summarizer_model.clone().or(Some(model.clone())),
            Some(settings.llm_timeout_s),
        ));
        let context = ContextManager::new(workspace.clone(), Some(summarizer))?;
        let sessions = match session_manager {
            Some(sessions) => sessions,
            None => Arc::new(SessionManager::new()?),
        };

        let mut tools = ToolRegistry::new();
        let allowed_dir = settings.restrict_to_workspace.then(|| workspace.clone());
        tools.register(Arc::new(ReadFileTool::new(
            Some(workspace.clone()),
            allowed_dir.clone(),
        )));
        tools.register(Arc::new(WriteFileTool::new(
            Some(workspace.clone()),
            allowed_dir.clone(),
        )));
        tools.register(Arc::new(EditFileTool::new(
            Some(workspace.clone()),
            allowed_dir.clone(),
        )));
        tools.register(Arc::new(ListDirTool::new(
            Some(workspace.clone()),
            allowed_dir.clone(),
        )));
        tools.register(Arc::new(ExecTool::new(
            settings.exec_timeout_s,
            Some(workspace.clone()),
            None,
            settings.restrict_to_workspace,
        )));
        tools.register(Arc::new(WebSearchTool::new(
            settings.web_search_key.clone(),
            5,
        )));
        tools.register(Arc::new(WebFetchTool::new(50_000)));

        let message_tool = Arc::new(MessageTool::new(bus.outbound_sender()));
        tools.register(message_tool.clone());

        let subagents = Arc::new(SubagentManager::new(
            provider.clone(),
            workspace.clone(),
            bus.clone(),
            model.clone(),
            settings.web_search_key.clone(),
            settings.exec_timeout_s,
            Some(settings.llm_timeout_s),
            settings.restrict_to_workspace,
        ));
        let spawn_tool = Arc::new(SpawnTool::new(subagents.clone()));
        tools.register(spawn_tool.clone());

        let cron_tool = cron_service.map(|service| {
            let tool = Arc::new(CronTool::new(service));
            tools.register(tool.clone());
            tool
        });

        if let Some(memory) = vector_memory {
            tools.register(Arc::new(MemoryTool::new(memory, "agent")));
        }

        Ok(Self {
            bus,
            provider,
            workspace,
            model,
            max_iterations: settings.max_iterations,
            memory_window: settings.memory_window,
            llm_timeout_s: settings.llm_timeout_s,
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            context,
            sessions,
            tools: RwLock::new(tools),
            message_tool,
            spawn_tool,
            cron_tool,
            subagents,
            mcp,
            running: AtomicBool::new(false),
        })
    }

    /// Drain the inbound queue until stopped. Failures never leave the
    /// sender without an answer: errors go back as a best-effort apology.
    pub async fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::Relaxed);
        info!("agent loop started");

        while self.running.load(Ordering::Relaxed) {
            let msg = match timeout(Duration::from_secs(1), self.bus.consume_inbound()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(_) => continue,
            };

            match self.process_message(msg.clone(), None).await {
                Ok(Some(response)) => {
                    let _ = self.bus.publish_outbound(response);
                }
                Ok(None) => {
                    if msg.channel == "cli" {
                        // CLI front-ends need an empty reply to unblock
                        // their prompt.
                        let mut out = OutboundMessage::new(msg.channel, msg.chat_id, "");
                        out.metadata = msg.metadata;
                        let _ = self.bus.publish_outbound(out);
                    }
                }
                Err(err) => {
                    error!("error processing message: {err}");
                    let mut out = OutboundMessage::new(
                        msg.channel.clone(),
                        msg.chat_id.clone(),
                        format!("Sorry, I encountered an error: {err}"),
                    );
                    out.metadata = msg.metadata;
                    let _ = self.bus.publish_outbound(out);
                }
            }
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        info!("agent loop stopping");
    }

    pub async fn shutdown(&self) {
        self.stop();
        self.mcp.shutdown().await;
    }

    /// Process one inbound message. Returns the reply, or `None` when the
    /// message tool already answered during the turn.
    pub async fn process_message(
        &self,
        msg: InboundMessage,
        session_key_override: Option<&str>,
    ) -> Result<Option<OutboundMessage>> {
        let is_system = msg.channel == "system";

        // System messages encode their origin in chat_id.
        let (origin_channel, origin_chat_id) = if is_system {
            msg.chat_id
                .split_once(':')
                .map(|(c, id)| (c.to_string(), id.to_string()))
                .unwrap_or_else(|| ("cli".to_string(), msg.chat_id.clone()))
        } else {
            (msg.channel.clone(), msg.chat_id.clone())
        };
        let session_key = session_key_override
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| format!("{origin_channel}:{origin_chat_id}"));

        if is_system {
            info!("processing system message from {}", msg.sender_id);
        } else {
            info!(
                "processing message from {origin_channel}:{}: {}",
                msg.sender_id,
                truncate_string(&msg.content, 80)
            );
        }

        // MCP servers connect lazily on the first message; a failure is
        // retried on the next one.
        self.mcp.connect_all(&self.tools).await;

        let mut session = self.sessions.get_or_create(&session_key);

        self.message_tool
            .set_context(origin_channel.clone(), origin_chat_id.clone());
        self.message_tool.start_turn();
        self.spawn_tool
            .set_context(origin_channel.clone(), origin_chat_id.clone());
        if let Some(cron_tool) = &self.cron_tool {
            cron_tool.set_context(origin_channel.clone(), origin_chat_id.clone());
        }

        let media = (!is_system && !msg.media.is_empty()).then(|| msg.media.as_slice());
        let history = session.get_history(self.memory_window);
        let messages = self.context.build_messages(
            &history,
            &msg.content,
            &msg.sender_id,
            Some(&origin_channel),
            Some(&origin_chat_id),
            media,
            None,
            None,
            &self.model,
        );

        let (messages, compacted) = self
            .context
            .compact_if_needed(
                messages,
                self.memory_window,
                None,
                &self.model,
                self.memory_window,
            )
            .await;
        if compacted {
            // Record the summary in the archive so get_history projects
            // from it on the next turn.
            if let Some(summary) = messages.iter().find_map(|m| {
                m.get("content")
                    .and_then(Value::as_str)
                    .filter(|c| c.starts_with(ContextManager::SUMMARY_PREFIX))
            }) {
                session.add_message("system", summary);
            }
        }

        let bus = self.bus.clone();
        let progress_channel = origin_channel.clone();
        let progress_chat_id = origin_chat_id.clone();
        let progress_metadata = msg.metadata.clone();
        let on_progress: ProgressFn = Arc::new(move |content: String| {
            let bus = bus.clone();
            let channel = progress_channel.clone();
            let chat_id = progress_chat_id.clone();
            let metadata = progress_metadata.clone();
            Box::pin(async move {
                let mut out = OutboundMessage::new(channel, chat_id, content);
                out.metadata = metadata;
                let _ = bus.publish_outbound(out);
            })
        });

        let (final_content, _tools_used) = self
            .run_agent_loop(messages, Some(on_progress))
            .await;

        let final_content = match final_content.filter(|c| !c.trim().is_empty()) {
            Some(content) => content,
            None if is_system => "Background task completed.".to_string(),
            None => "I've completed processing but have no response to give.".to_string(),
        };

        info!(
            "response to {origin_channel}:{}: {}",
            msg.sender_id,
            truncate_string(&final_content, 120)
        );

        let user_content = if is_system {
            format!("[System: {}] {}", msg.sender_id, msg.content)
        } else {
            msg.content.clone()
        };
        session.add_message("user", &user_content);
        session.add_message("assistant", &final_content);
        self.sessions.save(&session)?;

        // The message tool already delivered a reply this turn; a fallback
        // would duplicate it.
        if self.message_tool.sent_in_turn() {
            return Ok(None);
        }

        let mut outbound = OutboundMessage::new(origin_channel, origin_chat_id, final_content);
        outbound.reply_to = msg
            .metadata
            .get("reply_to")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        outbound.metadata = msg.metadata;
        Ok(Some(outbound))
    }

    /// Strip `<think>…</think>` blocks some models embed in content.
    fn strip_think(text: Option<String>) -> Option<String> {
        let text = text?;
        let re = Regex::new(r"(?s)<think>.*?</think>").expect("static regex");
        let cleaned = re.replace_all(&text, "").trim().to_string();
        (!cleaned.is_empty()).then_some(cleaned)
    }

    /// One-line hint like `web_search("rust async")` for progress updates.
    fn tool_hint(tool_calls: &[crate::providers::ToolCallRequest]) -> String {
        tool_calls
            .iter()
            .map(|tc| {
                let arg = tc.arguments.values().next().and_then(Value::as_str);
                match arg {
                    Some(value) if value.len() > 40 => {
                        format!("{}(\"{}...\")", tc.name, &value[..40])
                    }
                    Some(value) => format!("{}(\"{value}\")", tc.name),
                    None => tc.name.clone(),
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// The reason-act cycle: call the provider, execute tool calls in
    /// provider order, repeat until a plain answer or iteration exhaustion.
    async fn run_agent_loop(
        &self,
        mut messages: Vec<Value>,
        on_progress: Option<ProgressFn>,
    ) -> (Option<String>, Vec<String>) {
        let mut tools_used = Vec::new();

        for _iteration in 1..=self.max_iterations {
            let tool_defs = self.tools.read().await.get_definitions();
            let call = self.provider.chat(
                &messages,
                Some(&tool_defs),
                Some(&self.model),
                self.max_tokens,
                self.temperature,
                Some(self.llm_timeout_s),
            );
            // Belt and braces: the provider applies its own request
            // timeout, this bounds everything else around it.
            let response = match timeout(Duration::from_secs(self.llm_timeout_s + 5), call).await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => crate::providers::LLMResponse::error(format!(
                    "Error calling LLM: {err}"
                )),
                Err(_) => crate::providers::LLMResponse::error(format!(
                    "Error: LLM call timed out after {}s",
                    self.llm_timeout_s
                )),
            };

            if !response.has_tool_calls() {
                return (Self::strip_think(response.content), tools_used);
            }

            if let Some(on_progress) = &on_progress {
                if let Some(clean) = Self::strip_think(response.content.clone()) {
                    on_progress(clean).await;
                }
                on_progress(Self::tool_hint(&response.tool_calls)).await;
            }

            let tool_call_dicts = response
                .tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": serde_json::to_string(&tc.arguments)
                                .unwrap_or_else(|_| "{}".to_string()),
                        }
                    })
                })
                .collect::<Vec<_>>();
            self.context.add_assistant_message(
                &mut messages,
                response.content.as_deref(),
                Some(tool_call_dicts),
                response.reasoning_content.as_deref(),
            );

            for tool_call in response.tool_calls {
                tools_used.push(tool_call.name.clone());
                info!(
                    "tool call: {}({})",
                    tool_call.name,
                    truncate_string(
                        &serde_json::to_string(&tool_call.arguments).unwrap_or_default(),
                        200
                    )
                );
                let result = self
                    .tools
                    .read()
                    .await
                    .execute(&tool_call.name, &tool_call.arguments)
                    .await;
                self.context.add_tool_result(
                    &mut messages,
                    &tool_call.id,
                    &tool_call.name,
                    &result,
                );
            }
        }

        warn!("max iterations reached ({})", self.max_iterations);
        (None, tools_used)
    }

    /// Process a message directly, for CLI and scheduler paths.
    pub async fn process_direct(
        &self,
        content: &str,
        session_key: Option<&str>,
        channel: Option<&str>,
        chat_id: Option<&str>,
    ) -> Result<String> {
        let session_key = session_key.unwrap_or("cli:direct");
        let (default_channel, default_chat_id) = session_key
            .split_once(':')
            .map(|(c, id)| (c.to_string(), id.to_string()))
            .unwrap_or_else(|| ("cli".to_string(), "direct".to_string()));
        let channel = channel.unwrap_or(&default_channel);
        let chat_id = chat_id.unwrap_or(&default_chat_id);

        let msg = InboundMessage::new(channel, "user", chat_id, content);
        let response = self.process_message(msg, Some(session_key)).await?;
        Ok(response.map(|r| r.content).unwrap_or_default())
    }

    pub fn workspace(&self) -> &PathBuf {
        &self.workspace
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        self.sessions.clone()
    }

    pub async fn running_subagents(&self) -> usize {
        self.subagents.running_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::summarizer::tests::MockProvider;
    use uuid::Uuid;

    fn temp_workspace() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nightowl-agent-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    fn temp_sessions() -> Arc<SessionManager> {
        let dir = std::env::temp_dir().join(format!("nightowl-agent-sess-{}", Uuid::new_v4()));
        Arc::new(SessionManager::with_dir(dir).expect("sessions"))
    }

    fn agent_with(
        provider: Arc<MockProvider>,
        settings: AgentSettings,
    ) -> (Arc<AgentLoop>, Arc<MessageBus>, Arc<SessionManager>) {
        let bus = Arc::new(MessageBus::new());
        let sessions = temp_sessions();
        let agent = AgentLoop::new(
            bus.clone(),
            provider,
            temp_workspace(),
            settings,
            None,
            Some(sessions.clone()),
            None,
            Arc::new(McpManager::new(Default::default())),
        )
        .expect("agent");
        (Arc::new(agent), bus, sessions)
    }

    #[tokio::test]
    async fn echo_turn_produces_one_outbound_and_saves_session() {
        let provider = Arc::new(MockProvider::new(vec![MockProvider::text("pong")]));
        let (agent, _bus, sessions) = agent_with(provider, AgentSettings::default());

        let msg = InboundMessage::new("cli", "user", "s1", "say 'pong'");
        let response = agent
            .process_message(msg, None)
            .await
            .expect("process")
            .expect("outbound");
        assert_eq!(response.channel, "cli");
        assert_eq!(response.chat_id, "s1");
        assert_eq!(response.content, "pong");

        let session = sessions.get_or_create("cli:s1");
        let len = session.messages.len();
        assert_eq!(session.messages[len - 2].role, "user");
        assert_eq!(session.messages[len - 2].content, "say 'pong'");
        assert_eq!(session.messages[len - 1].role, "assistant");
        assert_eq!(session.messages[len - 1].content, "pong");
    }

    #[tokio::test]
    async fn tool_call_then_answer() {
        let provider = Arc::new(MockProvider::new(vec![
            MockProvider::tool_call("c1", "read_file", json!({ "path": "note.txt" })),
            MockProvider::text("it says hello"),
        ]));
        let (agent, bus, _sessions) = agent_with(provider.clone(), AgentSettings::default());
        std::fs::write(agent.workspace().join("note.txt"), "hello").expect("write note");

        let msg = InboundMessage::new("cli", "user", "s1", "read the note");
        let response = agent
            .process_message(msg, None)
            .await
            .expect("process")
            .expect("outbound");
        assert_eq!(response.content, "it says hello");

        // The second provider call saw the assistant tool-call message and
        // the tool result, in order.
        let calls = provider.calls.lock().expect("calls");
        assert_eq!(calls.len(), 2);
        let second = &calls[1];
        let assistant = &second[second.len() - 2];
        assert_eq!(assistant["role"], "assistant");
        assert!(assistant["tool_calls"].is_array());
        let tool = &second[second.len() - 1];
        assert_eq!(tool["role"], "tool");
        assert_eq!(tool["content"], "hello");

        // Only the progress hint went over the bus; the reply itself is
        // returned to the caller.
        assert_eq!(bus.outbound_size(), 1);
        let progress = bus.consume_outbound().await.expect("progress");
        assert!(progress.content.contains("read_file("));
    }

    #[tokio::test]
    async fn message_tool_suppresses_fallback_reply() {
        let provider = Arc::new(MockProvider::new(vec![
            MockProvider::tool_call("c1", "message", json!({ "content": "done already" })),
            MockProvider::text("wrap-up text"),
        ]));
        let (agent, bus, _sessions) = agent_with(provider, AgentSettings::default());

        let msg = InboundMessage::new("telegram", "user", "42", "ping me");
        let response = agent.process_message(msg, None).await.expect("process");
        assert!(response.is_none());

        // One outbound from the tool itself (plus the progress hint).
        let mut tool_sends = 0;
        while bus.outbound_size() > 0 {
            let out = bus.consume_outbound().await.expect("outbound");
            if out.content == "done already" {
                tool_sends += 1;
            }
        }
        assert_eq!(tool_sends, 1);
    }

    #[tokio::test]
    async fn iteration_exhaustion_substitutes_filler() {
        // Provider never stops calling tools.
        let responses = (0..5)
            .map(|i| MockProvider::tool_call(&format!("c{i}"), "list_dir", json!({ "path": "." })))
            .collect();
        let provider = Arc::new(MockProvider::new(responses));
        let settings = AgentSettings {
            max_iterations: 3,
            ..Default::default()
        };
        let (agent, _bus, _sessions) = agent_with(provider, settings);

        let msg = InboundMessage::new("cli", "user", "s1", "loop forever");
        let response = agent
            .process_message(msg, None)
            .await
            .expect("process")
            .expect("outbound");
        assert_eq!(
            response.content,
            "I've completed processing but have no response to give."
        );
    }

    #[tokio::test]
    async fn failing_tool_still_terminates_turn() {
        let provider = Arc::new(MockProvider::new(vec![
            MockProvider::tool_call("c1", "no_such_tool", json!({})),
            MockProvider::text("recovered"),
        ]));
        let (agent, _bus, _sessions) = agent_with(provider.clone(), AgentSettings::default());

        let msg = InboundMessage::new("cli", "user", "s1", "try a tool");
        let response = agent
            .process_message(msg, None)
            .await
            .expect("process")
            .expect("outbound");
        assert_eq!(response.content, "recovered");

        let calls = provider.calls.lock().expect("calls");
        let tool_result = calls[1].last().expect("tool message");
        assert!(
            tool_result["content"]
                .as_str()
                .expect("content")
                .contains("not found")
        );
    }

    #[tokio::test]
    async fn system_message_routes_to_origin_session() {
        let provider = Arc::new(MockProvider::new(vec![MockProvider::text("done")]));
        let (agent, _bus, sessions) = agent_with(provider, AgentSettings::default());

        let msg = InboundMessage::new("system", "cron", "telegram:42", "run the job");
        let response = agent
            .process_message(msg, None)
            .await
            .expect("process")
            .expect("outbound");
        assert_eq!(response.channel, "telegram");
        assert_eq!(response.chat_id, "42");

        let session = sessions.get_or_create("telegram:42");
        assert!(session.messages[0].content.starts_with("[System: cron]"));
    }

    #[tokio::test]
    async fn system_message_empty_answer_uses_background_filler() {
        let provider = Arc::new(MockProvider::new(vec![MockProvider::text("")]));
        let (agent, _bus, _sessions) = agent_with(provider, AgentSettings::default());

        let msg = InboundMessage::new("system", "heartbeat", "cli:direct", "check tasks");
        let response = agent
            .process_message(msg, None)
            .await
            .expect("process")
            .expect("outbound");
        assert_eq!(response.content, "Background task completed.");
    }

    #[tokio::test]
    async fn compaction_appends_summary_record_to_archive() {
        let mut responses = vec![MockProvider::text("S")]; // summarizer call
        responses.push(MockProvider::text("final answer"));
        let provider = Arc::new(MockProvider::new(responses));
        let settings = AgentSettings {
            memory_window: 4,
            ..Default::default()
        };
        let (agent, _bus, sessions) = agent_with(provider, settings);

        // Preload an oversized session.
        let mut session = sessions.get_or_create("cli:s1");
        for i in 0..10 {
            session.add_message("user", &format!("q{i}"));
            session.add_message("assistant", &format!("a{i}"));
        }
        sessions.save(&session).expect("save");

        let msg = InboundMessage::new("cli", "user", "s1", "next question");
        let response = agent
            .process_message(msg, None)
            .await
            .expect("process")
            .expect("outbound");
        assert_eq!(response.content, "final answer");

        let session = sessions.get_or_create("cli:s1");
        let summary_pos = session
            .messages
            .iter()
            .position(|m| m.role == "system")
            .expect("summary record");
        assert!(
            session.messages[summary_pos]
                .content
                .starts_with(ContextManager::SUMMARY_PREFIX)
        );
        // Next-turn history starts at the summary.
        let history = session.get_history(50);
        assert_eq!(
            history[0]["content"],
            session.messages[summary_pos].content
        );
    }

    #[tokio::test]
    async fn strip_think_removes_blocks() {
        assert_eq!(
            AgentLoop::strip_think(Some("<think>hmm</think>the answer".to_string())),
            Some("the answer".to_string())
        );
        assert_eq!(
            AgentLoop::strip_think(Some("<think>only thoughts</think>".to_string())),
            None
        );
        assert_eq!(AgentLoop::strip_think(None), None);
    }

    #[test]
    fn tool_hint_truncates_long_arguments() {
        let calls = vec![crate::providers::ToolCallRequest {
            id: "c1".to_string(),
            name: "web_search".to_string(),
            arguments: json!({ "query": "x".repeat(60) })
                .as_object()
                .cloned()
                .expect("map"),
        }];
        let hint = AgentLoop::tool_hint(&calls);
        assert!(hint.starts_with("web_search(\""));
        assert!(hint.ends_with("...\")"));
    }

    #[tokio::test]
    async fn process_direct_returns_content() {
        let provider = Arc::new(MockProvider::new(vec![MockProvider::text("direct reply")]));
        let (agent, _bus, sessions) = agent_with(provider, AgentSettings::default());

        let reply = agent
            .process_direct("hello", Some("cli:direct"), None, None)
            .await
            .expect("direct");
        assert_eq!(reply, "direct reply");
        assert!(!sessions.get_or_create("cli:direct").messages.is_empty());
    }
}
