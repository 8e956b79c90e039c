use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use voiceloop_core::types::ChatEntry;

pub const CHAT_HISTORY_FILE: &str = "chat_history.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub sender: String,
    pub text: String,
    // Unix milliseconds.
    pub ts: i64,
}

impl From<ChatRecord> for ChatEntry {
    fn from(r: ChatRecord) -> Self {
        ChatEntry::new(r.sender, r.text)
    }
}

/// A capped JSON array of chat records, rewritten atomically on append.
#[derive(Debug, Clone)]
pub struct ChatHistoryStore {
    path: PathBuf,
    max_entries: usize,
}

impl ChatHistoryStore {
    pub fn at_path(path: PathBuf) -> Self {
        Self {
            path,
            max_entries: 500,
        }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::at_path(dir.join(CHAT_HISTORY_FILE))
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max.max(1);
        self
    }

    pub fn load(&self) -> anyhow::Result<Vec<ChatRecord>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }

        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read chat history: {}", self.path.display()))?;
        let entries: Vec<ChatRecord> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse chat history: {}", self.path.display()))?;
        Ok(entries)
    }

    pub fn append(&self, sender: &str, text: &str) -> anyhow::Result<()> {
        let mut entries = self.load()?;
        entries.push(ChatRecord {
            sender: sender.to_string(),
            text: text.to_string(),
            ts: chrono::Utc::now().timestamp_millis(),
        });
        if entries.len() > self.max_entries {
            let start = entries.len() - self.max_entries;
            entries = entries.split_off(start);
        }

        let json = serde_json::to_vec_pretty(&entries)?;
        crate::fsutil::write_atomic(&self.path, &json)
            .with_context(|| format!("failed to replace chat history: {}", self.path.display()))
    }

    /// The last `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> anyhow::Result<Vec<ChatEntry>> {
        let mut entries = self.load()?;
        let start = entries.len().saturating_sub(limit);
        Ok(entries.drain(start..).map(ChatEntry::from).collect())
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove chat history: {}", self.path.display()))?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_and_limits_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatHistoryStore::in_dir(dir.path()).with_max_entries(2);

        store.append("User", "a").unwrap();
        store.append("Assistant", "b").unwrap();
        store.append("User", "c").unwrap();

        let entries = store.load().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].text, "b");
        assert_eq!(entries[1].sender, "User");
        assert!(entries[1].ts >= entries[0].ts);
    }

    #[test]
    fn recent_returns_tail_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatHistoryStore::in_dir(dir.path());
        for i in 0..5 {
            store.append("User", &format!("m{i}")).unwrap();
        }

        let recent = store.recent(3).unwrap();
        let texts: Vec<_> = recent.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
        assert_eq!(store.recent(50).unwrap().len(), 5);
        assert!(store.recent(0).unwrap().is_empty());
    }

    #[test]
    fn missing_file_is_empty_and_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatHistoryStore::in_dir(dir.path());
        assert!(store.load().unwrap().is_empty());
        store.clear().unwrap();
        store.append("User", "x").unwrap();
        store.clear().unwrap();
        assert!(!store.path().exists());
    }
}
