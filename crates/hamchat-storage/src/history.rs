//! Append-only chat log.
//!
//! Sequence numbers are positions in the log (0-based). An entry is
//! durable in the backend before `append` hands back its number, and the
//! in-memory order is the order in which appends took the lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

use crate::{HistoryBackend, Result, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub recipient: String,
    pub body: String,
    /// Absent on entries written by older servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logged_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            body: body.into(),
            logged_at: Some(Utc::now()),
        }
    }
}

pub struct ChatLog {
    entries: Mutex<Vec<ChatMessage>>,
    backend: Box<dyn HistoryBackend>,
}

impl ChatLog {
    pub fn open(backend: Box<dyn HistoryBackend>) -> Result<Self> {
        let entries = backend.load()?;
        tracing::info!(entries = entries.len(), "history: loaded");
        Ok(Self {
            entries: Mutex::new(entries),
            backend,
        })
    }

    fn entries(&self) -> Result<MutexGuard<'_, Vec<ChatMessage>>> {
        self.entries.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Append a message and return its sequence number.
    ///
    /// The backend write happens under the lock so file order and sequence
    /// order agree. Nothing is recorded in memory if the write fails.
    pub fn append(&self, sender: &str, recipient: &str, body: &str) -> Result<u64> {
        let message = ChatMessage::new(sender, recipient, body);
        let mut entries = self.entries()?;
        self.backend.append(&message)?;
        let seq = entries.len() as u64;
        entries.push(message);
        tracing::debug!(seq, %sender, %recipient, "history: appended");
        Ok(seq)
    }

    pub fn get(&self, seq: u64) -> Result<Option<ChatMessage>> {
        let entries = self.entries()?;
        Ok(usize::try_from(seq)
            .ok()
            .and_then(|i| entries.get(i))
            .cloned())
    }

    /// The last `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<ChatMessage>> {
        let entries = self.entries()?;
        let start = entries.len().saturating_sub(limit);
        Ok(entries[start..].to_vec())
    }

    pub fn snapshot(&self) -> Result<Vec<ChatMessage>> {
        Ok(self.entries()?.clone())
    }

    pub fn len(&self) -> usize {
        self.entries().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
