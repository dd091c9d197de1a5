use crate::agent::summarizer::Summarizer;
use crate::memory::MemoryStore;
use crate::session::SessionManager;
use crate::utils::today_date;
use crate::vector_memory::{MemoryTag, VectorMemory};
use anyhow::Result;
use chrono::Local;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const DEFAULT_SUMMARY_HOUR: u32 = 3;

/// Once-a-day consolidation: every session gets summarized into the daily
/// journal and its extracted facts appended to long-term memory (and the
/// vector store when one is wired in).
pub struct DailySummaryService {
    summarizer: Arc<Summarizer>,
    sessions: Arc<SessionManager>,
    journal: MemoryStore,
    memory: Option<Arc<dyn VectorMemory>>,
    summary_hour: u32,
    enabled: bool,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    last_run_date: Mutex<Option<String>>,
}

impl DailySummaryService {
    pub fn new(
        workspace: PathBuf,
        summarizer: Arc<Summarizer>,
        sessions: Arc<SessionManager>,
        summary_hour: u32,
        enabled: bool,
        memory: Option<Arc<dyn VectorMemory>>,
    ) -> Result<Self> {
        Ok(Self {
            summarizer,
            sessions,
            journal: MemoryStore::new(workspace)?,
            memory,
            summary_hour,
            enabled,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            last_run_date: Mutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        if !self.enabled {
            info!("daily summary service disabled");
            return;
        }
        self.running.store(true, Ordering::Relaxed);

        let service = self.clone();
        let handle = tokio::spawn(async move {
            while service.running.load(Ordering::Relaxed) {
                tokio::time::sleep(std::time::Duration::from_secs(60 * 60)).await;
                if !service.running.load(Ordering::Relaxed) {
                    break;
                }
                if service.should_run().await {
                    if let Err(err) = service.run_daily_summary().await {
                        error!("daily summary error: {err}");
                    }
                }
            }
        });
        *self.task.lock().await = Some(handle);
        info!(
            "daily summary service started (runs at {:02}:00)",
            self.summary_hour
        );
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }

    /// Right hour, and not already run today.
    async fn should_run(&self) -> bool {
        let now = Local::now();
        let today = today_date();
        if self.last_run_date.lock().await.as_deref() == Some(today.as_str()) {
            return false;
        }
        now.format("%H").to_string() == format!("{:02}", self.summary_hour)
    }

    async fn run_daily_summary(&self) -> Result<()> {
        let today = today_date();
        info!("running daily summary");
        *self.last_run_date.lock().await = Some(today.clone());

        let session_keys = self.sessions.list_sessions();
        if session_keys.is_empty() {
            info!("no sessions to summarize");
            return Ok(());
        }

        let mut all_summaries = Vec::new();
        let mut all_facts = Vec::new();

        for key in session_keys {
            let session = self.sessions.get_or_create(&key);
            let messages = session.get_history(0);
            if messages.len() < 2 {
                continue;
            }

            let digest = self.summarizer.summarize_session(&messages, &key).await;
            if !digest.summary.is_empty() {
                all_summaries.push(format!("### {key}\n{}", digest.summary));
            }
            if !digest.facts.is_empty() {
                all_facts.push(digest.facts);
            }
        }

        if !all_summaries.is_empty() {
            let content = format!("## Conversation Summaries\n\n{}", all_summaries.join("\n\n"));
            self.journal.append_today(&content)?;
            info!(
                "appended {} session summaries to daily notes",
                all_summaries.len()
            );
        }

        if !all_facts.is_empty() {
            self.update_long_term_memory(&all_facts).await?;
        }

        info!(
            "daily summary complete: {} sessions, {} fact extractions",
            all_summaries.len(),
            all_facts.len()
        );
        Ok(())
    }

    /// Append the day's facts to the journal and push each fact line into
    /// vector memory.
    async fn update_long_term_memory(&self, facts: &[String]) -> Result<()> {
        let existing = self.journal.read_long_term();
        let update = format!(
            "{existing}\n\n## Updates from {}\n\n{}",
            today_date(),
            facts.join("\n")
        );
        self.journal.write_long_term(&update)?;

        let Some(memory) = &self.memory else {
            return Ok(());
        };
        let mut stored = 0;
        for block in facts {
            for line in block.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match memory
                    .add(
                        line,
                        "daily_summary",
                        MemoryTag::Default,
                        Vec::new(),
                        Some("consolidation"),
                    )
                    .await
                {
                    Ok(Some(_)) => stored += 1,
                    Ok(None) => {}
                    Err(err) => warn!("failed to store fact in vector memory: {err}"),
                }
            }
        }
        if stored > 0 {
            info!("stored {stored} facts in vector memory");
        }
        Ok(())
    }

    /// Manual trigger, mainly for the CLI and tests.
    pub async fn run_now(&self) -> Result<usize> {
        let count = self.sessions.list_sessions().len();
        self.run_daily_summary().await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::summarizer::tests::MockProvider;
    use crate::providers::LLMResponse;
    use crate::vector_memory::{MemoryMetadata, MemoryRecord};
    use async_trait::async_trait;
    use uuid::Uuid;

    struct RecordingMemory {
        stored: Mutex<Vec<MemoryRecord>>,
    }

    #[async_trait]
    impl VectorMemory for RecordingMemory {
        async fn add(
            &self,
            content: &str,
            author: &str,
            tag: MemoryTag,
            categories: Vec<String>,
            source: Option<&str>,
        ) -> Result<Option<MemoryRecord>> {
            let record = MemoryRecord {
                id: MemoryRecord::generate_id(content, None),
                content: content.to_string(),
                metadata: MemoryMetadata {
                    tag,
                    weight: 0.5,
                    timestamp: crate::utils::timestamp(),
                    author: author.to_string(),
                    categories,
                    content_hash: MemoryRecord::content_hash(content),
                    source: source.map(ToOwned::to_owned),
                    project: None,
                    decision: false,
                },
                distance: None,
            };
            self.stored.lock().await.push(record.clone());
            Ok(Some(record))
        }

        async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<MemoryRecord>> {
            Ok(Vec::new())
        }

        async fn delete(&self, _memory_id: &str) -> Result<bool> {
            Ok(false)
        }
    }

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nightowl-{label}-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    fn seeded_sessions() -> Arc<SessionManager> {
        let sessions =
            Arc::new(SessionManager::with_dir(temp_dir("daily-sess")).expect("sessions"));
        let mut chat = sessions.get_or_create("telegram:42");
        chat.add_message("user", "please remember the deploy is friday");
        chat.add_message("assistant", "noted, deploy on friday");
        sessions.save(&chat).expect("save");

        // Too short to summarize.
        let mut stub = sessions.get_or_create("cli:stub");
        stub.add_message("user", "hi");
        sessions.save(&stub).expect("save");
        sessions
    }

    fn service_with(
        responses: Vec<LLMResponse>,
        memory: Option<Arc<dyn VectorMemory>>,
    ) -> (Arc<DailySummaryService>, PathBuf) {
        let workspace = temp_dir("daily-ws");
        let provider = Arc::new(MockProvider::new(responses));
        let summarizer = Arc::new(Summarizer::new(provider, None, None));
        let service = DailySummaryService::new(
            workspace.clone(),
            summarizer,
            seeded_sessions(),
            DEFAULT_SUMMARY_HOUR,
            true,
            memory,
        )
        .expect("service");
        (Arc::new(service), workspace)
    }

    #[tokio::test]
    async fn consolidates_sessions_into_journal_and_memory() {
        let memory = Arc::new(RecordingMemory {
            stored: Mutex::new(Vec::new()),
        });
        // One summarizable session: summary call then facts call.
        let (service, workspace) = service_with(
            vec![
                MockProvider::text("talked about the friday deploy"),
                MockProvider::text("# Facts\n- deploy is friday\n- user runs the deploy"),
            ],
            Some(memory.clone()),
        );

        service.run_now().await.expect("run");

        let store = MemoryStore::new(workspace).expect("store");
        let today = store.read_today();
        assert!(today.contains("## Conversation Summaries"));
        assert!(today.contains("### telegram:42"));
        assert!(today.contains("talked about the friday deploy"));
        assert!(!today.contains("cli:stub"));

        let long_term = store.read_long_term();
        assert!(long_term.contains("## Updates from"));
        assert!(long_term.contains("- deploy is friday"));

        // Header line skipped, fact lines stored with consolidation source.
        let stored = memory.stored.lock().await;
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|r| r.metadata.source.as_deref() == Some("consolidation")));
        assert!(stored.iter().all(|r| r.metadata.tag == MemoryTag::Default));
        assert!(stored.iter().all(|r| r.metadata.author == "daily_summary"));
    }

    #[tokio::test]
    async fn same_day_reentry_is_noop() {
        let (service, workspace) = service_with(
            vec![
                MockProvider::text("first summary"),
                MockProvider::text("Nothing to extract."),
            ],
            None,
        );

        service.run_now().await.expect("first run");
        assert!(!service.should_run().await);

        // Re-entry produces no further journal writes: the mock provider is
        // exhausted, so another run would append error markers.
        let store = MemoryStore::new(workspace).expect("store");
        let before = store.read_today();
        if service.should_run().await {
            service.run_now().await.expect("second run");
        }
        assert_eq!(store.read_today(), before);
    }

    #[tokio::test]
    async fn empty_facts_leave_long_term_untouched() {
        let (service, workspace) = service_with(
            vec![
                MockProvider::text("a summary"),
                MockProvider::text("Nothing to extract."),
            ],
            None,
        );
        service.run_now().await.expect("run");

        let store = MemoryStore::new(workspace).expect("store");
        assert!(store.read_long_term().is_empty());
        assert!(store.read_today().contains("a summary"));
    }
}
