//! Hamchat Node -- relay server library.
//!
//! Re-exports the server pieces so integration tests and the binary share
//! one set of types: config, registry, session worker, broadcaster,
//! console, accept loop and client.

pub mod broadcast;
pub mod client;
pub mod config;
pub mod console;
pub mod registry;
pub mod server;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use hamchat_crypto::PasswordHasher;
use hamchat_storage::{AccountFile, AccountStore, ChatLog, HistoryFile};

use crate::config::HamchatConfig;
use crate::registry::SessionRegistry;
use crate::worker::SessionSettings;

/// Shared server state handed to every session worker.
#[derive(Clone)]
pub struct Relay {
    pub accounts: Arc<AccountStore>,
    pub history: Arc<ChatLog>,
    pub registry: SessionRegistry,
    pub settings: SessionSettings,
}

impl Relay {
    pub fn new(
        accounts: AccountStore,
        history: ChatLog,
        settings: SessionSettings,
        max_sessions: usize,
    ) -> Self {
        Self {
            accounts: Arc::new(accounts),
            history: Arc::new(history),
            registry: SessionRegistry::new(max_sessions),
            settings,
        }
    }

    /// Open the file-backed stores named in `cfg`.
    pub fn open(cfg: &HamchatConfig) -> anyhow::Result<Self> {
        let accounts_path = expand_tilde(&cfg.storage.accounts_file);
        let history_path = expand_tilde(&cfg.storage.history_file);

        let accounts = AccountStore::open(
            Box::new(AccountFile::new(&accounts_path)),
            PasswordHasher::new(cfg.security.scrypt_log_n),
            cfg.storage.max_accounts,
        )
        .map_err(|e| anyhow::anyhow!("opening {}: {e}", accounts_path.display()))?;

        let history = ChatLog::open(Box::new(HistoryFile::new(&history_path)))
            .map_err(|e| anyhow::anyhow!("opening {}: {e}", history_path.display()))?;

        tracing::info!(
            accounts = %accounts_path.display(),
            history = %history_path.display(),
            "storage opened"
        );

        Ok(Self::new(
            accounts,
            history,
            SessionSettings::from(&cfg.server),
            cfg.server.max_sessions,
        ))
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
