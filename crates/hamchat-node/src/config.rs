//! Configuration types for hamchat-node.
//! Parsed from hamchat.toml; every field has a default.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HamchatConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub security: SecuritySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Seconds without an inbound frame before a session is closed.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: u32,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Queued DELIVER/BROADCAST responses per session before drops.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_sessions: default_max_sessions(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_auth_attempts: default_max_auth_attempts(),
            max_frame_bytes: default_max_frame_bytes(),
            outbox_capacity: default_outbox_capacity(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl ServerSection {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// `listen_addr` with its port replaced.
    pub fn listen_addr_with_port(&self, port: u16) -> String {
        match self.listen_addr.rsplit_once(':') {
            Some((host, _)) => format!("{host}:{port}"),
            None => format!("{}:{port}", self.listen_addr),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_accounts_file")]
    pub accounts_file: String,
    #[serde(default = "default_history_file")]
    pub history_file: String,
    #[serde(default = "default_max_accounts")]
    pub max_accounts: usize,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            accounts_file: default_accounts_file(),
            history_file: default_history_file(),
            max_accounts: default_max_accounts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySection {
    /// scrypt cost as log2(N) for newly hashed passwords.
    #[serde(default = "default_scrypt_log_n")]
    pub scrypt_log_n: u8,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            scrypt_log_n: default_scrypt_log_n(),
        }
    }
}

// Default value functions
fn default_listen_addr() -> String {
    "0.0.0.0:9000".into()
}
fn default_max_sessions() -> usize {
    10
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_max_auth_attempts() -> u32 {
    1
}
fn default_max_frame_bytes() -> usize {
    hamchat_protocol::DEFAULT_MAX_FRAME_BYTES
}
fn default_outbox_capacity() -> usize {
    64
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_accounts_file() -> String {
    "user_accounts.txt".into()
}
fn default_history_file() -> String {
    "chat_history.txt".into()
}
fn default_max_accounts() -> usize {
    hamchat_storage::accounts::DEFAULT_MAX_ACCOUNTS
}
fn default_scrypt_log_n() -> u8 {
    hamchat_crypto::DEFAULT_LOG_N
}

impl HamchatConfig {
    /// Load config from file, or fall back to defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: HamchatConfig = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.max_sessions == 0 {
            anyhow::bail!("server.max_sessions must be at least 1");
        }
        if self.server.max_auth_attempts == 0 {
            anyhow::bail!("server.max_auth_attempts must be at least 1");
        }
        if self.server.outbox_capacity == 0 {
            anyhow::bail!("server.outbox_capacity must be at least 1");
        }
        if self.server.idle_timeout_secs == 0 {
            anyhow::bail!("server.idle_timeout_secs must be at least 1");
        }
        if !(1..=hamchat_crypto::MAX_LOG_N).contains(&self.security.scrypt_log_n) {
            anyhow::bail!(
                "security.scrypt_log_n must be within 1..={}",
                hamchat_crypto::MAX_LOG_N
            );
        }
        Ok(())
    }
}
