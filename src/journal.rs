//! Append-only run log shared between the core and whatever presents it.

use std::sync::Mutex;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::types::{LogEntry, LogKind};

pub struct Journal {
    entries: Mutex<Vec<LogEntry>>,
    tx: broadcast::Sender<LogEntry>,
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            entries: Mutex::new(Vec::new()),
            tx,
        }
    }

    pub fn append(&self, kind: LogKind, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
        };

        match kind {
            LogKind::Error => tracing::error!(target: "goal_pilot::journal", "{}", entry.message),
            LogKind::Warning => tracing::warn!(target: "goal_pilot::journal", "{}", entry.message),
            LogKind::Model => tracing::debug!(target: "goal_pilot::journal", "model: {}", entry.message),
            _ => tracing::info!(target: "goal_pilot::journal", "[{}] {}", kind.as_str(), entry.message),
        }

        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        // Nobody listening is fine.
        let _ = self.tx.send(entry);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.append(LogKind::Info, message);
    }

    pub fn model(&self, message: impl Into<String>) {
        self.append(LogKind::Model, message);
    }

    pub fn action(&self, message: impl Into<String>) {
        self.append(LogKind::Action, message);
    }

    pub fn result(&self, message: impl Into<String>) {
        self.append(LogKind::Result, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.append(LogKind::Error, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.append(LogKind::Warning, message);
    }

    /// The last `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let start = entries.len().saturating_sub(n);
        entries[start..].to_vec()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn count_containing(&self, needle: &str) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.message.contains(needle))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_returns_tail_in_order() {
        let journal = Journal::new();
        for i in 0..10 {
            journal.info(format!("entry {i}"));
        }
        let recent = journal.recent(6);
        assert_eq!(recent.len(), 6);
        assert_eq!(recent[0].message, "entry 4");
        assert_eq!(recent[5].message, "entry 9");
        assert_eq!(journal.recent(50).len(), 10);
    }

    #[tokio::test]
    async fn subscribers_see_new_entries() {
        let journal = Journal::new();
        let mut rx = journal.subscribe();
        journal.warning("careful");
        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.kind, LogKind::Warning);
        assert_eq!(entry.message, "careful");
    }
}
