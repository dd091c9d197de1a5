use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::hash::{DefaultHasher, Hash, Hasher};

/// Decay tier for a stored memory. `Core` never decays, `Crucial` decays
/// slowly, `Default` at the normal rate; the storage engine applies the
/// actual decay schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTag {
    Core,
    Crucial,
    Default,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryMetadata {
    pub tag: MemoryTag,
    pub weight: f64,
    pub timestamp: String,
    pub author: String,
    pub categories: Vec<String>,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default)]
    pub decision: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub content: String,
    pub metadata: MemoryMetadata,
    /// Populated on search results only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
}

impl MemoryRecord {
    pub fn generate_id(content: &str, prefix: Option<&str>) -> String {
        let digest = Self::content_hash(content);
        let millis = chrono::Utc::now().timestamp_millis();
        match prefix {
            Some(prefix) => format!("{prefix}_{digest}_{millis}"),
            None => format!("{digest}_{millis}"),
        }
    }

    /// Dedup key over normalized content.
    pub fn content_hash(content: &str) -> String {
        let mut hasher = DefaultHasher::new();
        content.trim().to_lowercase().hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

/// Interface to the semantic memory collaborator. The embedding model and
/// vector storage live outside this crate; the memory tool and the daily
/// summary only speak this trait.
#[async_trait]
pub trait VectorMemory: Send + Sync {
    /// Store a memory. Returns `None` when the entry was rejected
    /// (empty content or deduplicated against an existing record).
    async fn add(
        &self,
        content: &str,
        author: &str,
        tag: MemoryTag,
        categories: Vec<String>,
        source: Option<&str>,
    ) -> Result<Option<MemoryRecord>>;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryRecord>>;

    async fn delete(&self, memory_id: &str) -> Result<bool>;
}
