use crate::bus::{MessageBus, OutboundMessage};
use crate::providers::LLMProvider;
use crate::tools::ToolRegistry;
use crate::tools::filesystem::{ListDirTool, ReadFileTool, WriteFileTool};
use crate::tools::shell::ExecTool;
use crate::tools::web::{WebFetchTool, WebSearchTool};
use crate::utils::truncate_string;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

const SUBAGENT_MAX_ITERATIONS: u32 = 15;

/// Runs background agent instances. Each subagent shares the provider,
/// workspace and tool policies of the main agent but drives its own
/// bounded loop, and announces its result to the origin chat via the bus.
pub struct SubagentManager {
    provider: Arc<dyn LLMProvider>,
    workspace: PathBuf,
    bus: Arc<MessageBus>,
    model: String,
    web_search_key: Option<String>,
    exec_timeout_s: u64,
    llm_timeout_s: Option<u64>,
    restrict_to_workspace: bool,
    running_tasks: Arc<Mutex<HashMap<String, tokio::task::JoinHandle<()>>>>,
}

impl SubagentManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        workspace: PathBuf,
        bus: Arc<MessageBus>,
        model: String,
        web_search_key: Option<String>,
        exec_timeout_s: u64,
        llm_timeout_s: Option<u64>,
        restrict_to_workspace: bool,
    ) -> Self {
        Self {
            provider,
            workspace,
            bus,
            model,
            web_search_key,
            exec_timeout_s,
            llm_timeout_s,
            restrict_to_workspace,
            running_tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a subagent and return an acknowledgement immediately. The
    /// spawned task publishes an outbound message to the origin when done.
    pub async fn spawn(
        &self,
        task: String,
        label: Option<String>,
        origin_channel: String,
        origin_chat_id: String,
    ) -> String {
        let task_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let display_label = label.unwrap_or_else(|| truncate_string(&task, 30));

        let provider = self.provider.clone();
        let workspace = self.workspace.clone();
        let model = self.model.clone();
        let web_search_key = self.web_search_key.clone();
        let exec_timeout_s = self.exec_timeout_s;
        let llm_timeout_s = self.llm_timeout_s;
        let restrict_to_workspace = self.restrict_to_workspace;
        let bus = self.bus.clone();
        let running_map = self.running_tasks.clone();
        let task_id_for_cleanup = task_id.clone();
        let task_for_run = task.clone();
        let label_for_run = display_label.clone();

        let handle = tokio::spawn(async move {
            info!("subagent '{label_for_run}' started");
            let result = run_subagent(
                provider,
                workspace,
                model,
                web_search_key,
                exec_timeout_s,
                llm_timeout_s,
                restrict_to_workspace,
                task_for_run,
            )
            .await;

            let content = match result {
                Ok(summary) => format!("[{label_for_run}] {summary}"),
                Err(err) => {
                    error!("subagent '{label_for_run}' failed: {err}");
                    format!("[{label_for_run}] The background task failed: {err}")
                }
            };

            let _ = bus.publish_outbound(OutboundMessage::new(
                origin_channel,
                origin_chat_id,
                content,
            ));
            running_map.lock().await.remove(&task_id_for_cleanup);
        });

        self.running_tasks
            .lock()
            .await
            .insert(task_id.clone(), handle);
        format!(
            "Subagent [{display_label}] started (id: {task_id}). I'll report back here when it completes."
        )
    }

    pub async fn running_count(&self) -> usize {
        self.running_tasks.lock().await.len()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_subagent(
    provider: Arc<dyn LLMProvider>,
    workspace: PathBuf,
    model: String,
    web_search_key: Option<String>,
    exec_timeout_s: u64,
    llm_timeout_s: Option<u64>,
    restrict_to_workspace: bool,
    task: String,
) -> anyhow::Result<String> {
    let mut tools = ToolRegistry::new();
    let allowed_dir = restrict_to_workspace.then(|| workspace.clone());
    tools.register(Arc::new(ReadFileTool::new(
        Some(workspace.clone()),
        allowed_dir.clone(),
    )));
    tools.register(Arc::new(WriteFileTool::new(
        Some(workspace.clone()),
        allowed_dir.clone(),
    )));
    tools.register(Arc::new(ListDirTool::new(
        Some(workspace.clone()),
        allowed_dir.clone(),
    )));
    tools.register(Arc::new(ExecTool::new(
        exec_timeout_s,
        Some(workspace.clone()),
        None,
        restrict_to_workspace,
    )));
    tools.register(Arc::new(WebSearchTool::new(web_search_key, 5)));
    tools.register(Arc::new(WebFetchTool::new(50_000)));

    let system_prompt = format!(
        "# Subagent\n\nYou are a subagent spawned by the main agent to complete a specific task.\n\n\
## Your Task\n{task}\n\n\
## Rules\n1. Stay focused: complete only the assigned task, nothing else\n\
2. Your final response will be reported back to the origin chat\n\
3. Do not initiate conversations or take on side tasks\n\
4. Be concise but informative in your findings\n\n\
## What You Can Do\n- Read and write files in the workspace\n- Execute shell commands\n- Search the web and fetch web pages\n\n\
## What You Cannot Do\n- Send messages directly to users\n- Spawn other subagents\n\n\
## Workspace\n{}\n",
        workspace.display()
    );

    let mut messages = vec![
        json!({ "role": "system", "content": system_prompt }),
        json!({ "role": "user", "content": task }),
    ];

    let mut final_result = None;
    for _ in 0..SUBAGENT_MAX_ITERATIONS {
        let tool_defs = tools.get_definitions();
        let response = provider
            .chat(
                &messages,
                Some(&tool_defs),
                Some(&model),
                4096,
                0.7,
                llm_timeout_s,
            )
            .await?;

        if response.has_tool_calls() {
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
            messages.push(json!({
                "role": "assistant",
                "content": response.content.unwrap_or_default(),
                "tool_calls": tool_call_dicts,
            }));
            for tc in response.tool_calls {
                let result = tools.execute(&tc.name, &tc.arguments).await;
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": tc.id,
                    "name": tc.name,
                    "content": result,
                }));
            }
        } else {
            final_result = response.content;
            break;
        }
    }

    Ok(final_result
        .unwrap_or_else(|| "Task completed but no final response was generated.".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::summarizer::tests::MockProvider;
    use uuid::Uuid;

    fn temp_workspace() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nightowl-subagent-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    #[tokio::test]
    async fn subagent_publishes_result_to_origin() {
        let bus = Arc::new(MessageBus::new());
        let provider = Arc::new(MockProvider::new(vec![MockProvider::text("found it")]));
        let manager = SubagentManager::new(
            provider,
            temp_workspace(),
            bus.clone(),
            "mock-model".to_string(),
            None,
            10,
            Some(30),
            true,
        );

        let ack = manager
            .spawn(
                "look something up".to_string(),
                Some("lookup".to_string()),
                "telegram".to_string(),
                "42".to_string(),
            )
            .await;
        assert!(ack.contains("Subagent [lookup] started"));

        let outbound = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            bus.consume_outbound(),
        )
        .await
        .expect("timeout")
        .expect("outbound");
        assert_eq!(outbound.channel, "telegram");
        assert_eq!(outbound.chat_id, "42");
        assert!(outbound.content.contains("found it"));
        assert!(outbound.content.contains("[lookup]"));
    }

    #[tokio::test]
    async fn subagent_runs_tools_before_finishing() {
        let ws = temp_workspace();
        std::fs::write(ws.join("note.txt"), "hello").expect("write");
        let bus = Arc::new(MessageBus::new());
        let provider = Arc::new(MockProvider::new(vec![
            MockProvider::tool_call("c1", "read_file", serde_json::json!({ "path": "note.txt" })),
            MockProvider::text("the note says hello"),
        ]));
        let manager = SubagentManager::new(
            provider.clone(),
            ws,
            bus.clone(),
            "mock-model".to_string(),
            None,
            10,
            None,
            true,
        );

        manager
            .spawn(
                "read the note".to_string(),
                None,
                "cli".to_string(),
                "direct".to_string(),
            )
            .await;

        let outbound = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            bus.consume_outbound(),
        )
        .await
        .expect("timeout")
        .expect("outbound");
        assert!(outbound.content.contains("the note says hello"));

        // Second provider call carried the tool result.
        let calls = provider.calls.lock().expect("calls");
        assert_eq!(calls.len(), 2);
        let last = calls[1].last().expect("tool message");
        assert_eq!(last["role"], "tool");
        assert_eq!(last["content"], "hello");
    }
}
