//! Hamchat Storage -- account table and chat log.
//!
//! Both stores keep their state in memory behind a single `Mutex` and go
//! through a backend trait for durability. A write reaches the backend
//! before the caller is told it succeeded.

pub mod accounts;
pub mod file;
pub mod history;

pub use accounts::{AccountError, AccountStore};
pub use file::{AccountFile, HistoryFile};
pub use history::{ChatLog, ChatMessage};

use hamchat_crypto::{CryptoError, PasswordHash};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("credential error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("{path}:{line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Credential as found in persistent storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredCredential {
    Hashed(PasswordHash),
    /// Clear-text password written by older servers. Migrated on load.
    Legacy(String),
}

/// One row of the account table as exchanged with a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub username: String,
    pub credential: StoredCredential,
}

/// Durable home of the account table. `save` replaces the whole table.
pub trait AccountBackend: Send + Sync {
    fn load(&self) -> Result<Vec<AccountRecord>>;
    fn save(&self, accounts: &[AccountRecord]) -> Result<()>;
}

/// Durable home of the chat log. `append` must be durable when it returns.
pub trait HistoryBackend: Send + Sync {
    fn load(&self) -> Result<Vec<ChatMessage>>;
    fn append(&self, message: &ChatMessage) -> Result<()>;
}
