use crate::utils::{ensure_dir, today_date};
use std::path::PathBuf;

/// Journal-style memory on disk: `memory/MEMORY.md` for long-term notes and
/// one `memory/YYYY-MM-DD.md` file per day.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    pub memory_dir: PathBuf,
    pub memory_file: PathBuf,
}

impl MemoryStore {
    pub fn new(workspace: PathBuf) -> std::io::Result<Self> {
        let memory_dir = ensure_dir(&workspace.join("memory"))?;
        let memory_file = memory_dir.join("MEMORY.md");
        Ok(Self {
            memory_dir,
            memory_file,
        })
    }

    pub fn today_file(&self) -> PathBuf {
        self.memory_dir.join(format!("{}.md", today_date()))
    }

    pub fn read_long_term(&self) -> String {
        std::fs::read_to_string(&self.memory_file).unwrap_or_default()
    }

    pub fn write_long_term(&self, content: &str) -> std::io::Result<()> {
        std::fs::write(&self.memory_file, content)
    }

    pub fn read_today(&self) -> String {
        std::fs::read_to_string(self.today_file()).unwrap_or_default()
    }

    pub fn append_today(&self, entry: &str) -> std::io::Result<()> {
        let path = self.today_file();
        let mut existing = std::fs::read_to_string(&path).unwrap_or_default();
        if existing.is_empty() {
            existing = format!("# {}\n\n", today_date());
        }
        existing.push_str(entry.trim_end());
        existing.push_str("\n\n");
        std::fs::write(&path, existing)
    }

    /// Prompt block combining long-term memory and today's note.
    /// Empty when both are empty, so callers can skip the section.
    pub fn get_memory_context(&self) -> String {
        let mut parts = Vec::new();
        let long_term = self.read_long_term();
        if !long_term.trim().is_empty() {
            parts.push(format!("## Long-term Memory\n{}", long_term.trim()));
        }
        let today = self.read_today();
        if !today.trim().is_empty() {
            parts.push(format!("## Today's Notes\n{}", today.trim()));
        }
        parts.join("\n\n")
    }
}
