//! Test harness for in-process hamchat-node integration tests.
//!
//! Provides TestRelay (a running server on an ephemeral port with temp
//! storage) and TestRelayBuilder (limits and pre-registered accounts).

use std::net::SocketAddr;
use std::time::Duration;

use hamchat_crypto::PasswordHasher;
use hamchat_node::client::{RelayClient, Reply};
use hamchat_node::registry::SessionInfo;
use hamchat_node::server::RelayServer;
use hamchat_node::worker::SessionSettings;
use hamchat_node::Relay;
use hamchat_protocol::{ErrorCode, Response};
use hamchat_storage::{AccountFile, AccountStore, ChatLog, HistoryFile};
use tokio::sync::broadcast;

/// Low scrypt cost keeps debug-build tests fast.
pub const TEST_LOG_N: u8 = 4;

/// A running in-process relay.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub relay: Relay,
    shutdown_tx: broadcast::Sender<()>,
    server: Option<tokio::task::JoinHandle<anyhow::Result<()>>>,
    tempdir: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestRelay {
    pub async fn start() -> anyhow::Result<Self> {
        TestRelayBuilder::new().build().await
    }

    pub async fn connect(&self) -> anyhow::Result<RelayClient> {
        Ok(RelayClient::connect(self.addr).await?)
    }

    /// Connect and log in as an existing account.
    pub async fn login(&self, username: &str, password: &str) -> anyhow::Result<RelayClient> {
        let mut client = self.connect().await?;
        let reply = client.login(username, password).await?;
        anyhow::ensure!(
            matches!(reply.response, Response::Ok { .. }),
            "login as {username} failed: {:?}",
            reply.response
        );
        Ok(client)
    }

    pub fn accounts_path(&self) -> std::path::PathBuf {
        self.tempdir.path().join("user_accounts.txt")
    }

    pub fn history_path(&self) -> std::path::PathBuf {
        self.tempdir.path().join("chat_history.txt")
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.relay.registry.active_sessions()
    }

    /// Poll the registry until `n` sessions are connected, or timeout.
    pub async fn wait_sessions(&self, n: usize, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let have = self.relay.registry.len();
            if have == n {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timeout waiting for {n} sessions (have {have})");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Signal shutdown and wait for the accept loop to finish.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(());
        if let Some(server) = self.server.take() {
            tokio::time::timeout(Duration::from_secs(10), server).await???;
        }
        Ok(())
    }
}

/// Builder for configuring and spawning a TestRelay.
pub struct TestRelayBuilder {
    max_sessions: usize,
    max_accounts: usize,
    settings: SessionSettings,
    accounts: Vec<(String, String)>,
}

#[allow(dead_code)]
impl TestRelayBuilder {
    pub fn new() -> Self {
        Self {
            max_sessions: 10,
            max_accounts: 10,
            settings: SessionSettings::default(),
            accounts: Vec::new(),
        }
    }

    pub fn max_sessions(mut self, n: usize) -> Self {
        self.max_sessions = n;
        self
    }

    pub fn max_accounts(mut self, n: usize) -> Self {
        self.max_accounts = n;
        self
    }

    pub fn max_auth_attempts(mut self, n: u32) -> Self {
        self.settings.max_auth_attempts = n;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.settings.idle_timeout = timeout;
        self
    }

    pub fn outbox_capacity(mut self, n: usize) -> Self {
        self.settings.outbox_capacity = n;
        self
    }

    pub fn account(mut self, username: &str, password: &str) -> Self {
        self.accounts.push((username.into(), password.into()));
        self
    }

    pub async fn build(self) -> anyhow::Result<TestRelay> {
        let tempdir = tempfile::tempdir()?;

        let accounts = AccountStore::open(
            Box::new(AccountFile::new(tempdir.path().join("user_accounts.txt"))),
            PasswordHasher::new(TEST_LOG_N),
            self.max_accounts,
        )?;
        for (username, password) in &self.accounts {
            accounts.register(username, password)?;
        }
        let history = ChatLog::open(Box::new(HistoryFile::new(
            tempdir.path().join("chat_history.txt"),
        )))?;

        let relay = Relay::new(accounts, history, self.settings, self.max_sessions);
        let server =
            RelayServer::bind_addr("127.0.0.1:0", Duration::from_secs(2), relay.clone()).await?;
        let addr = server.local_addr()?;
        let shutdown_tx = server.shutdown_handle();
        let server = tokio::spawn(server.run());

        Ok(TestRelay {
            addr,
            relay,
            shutdown_tx,
            server: Some(server),
            tempdir,
        })
    }
}

/// Unwrap an `ERROR` response's code.
#[allow(dead_code)]
pub fn error_code(reply: &Reply) -> ErrorCode {
    match &reply.response {
        Response::Error { code, .. } => *code,
        other => panic!("expected ERROR, got {other:?}"),
    }
}

/// Wait for the next response, failing the test if none arrives in time.
#[allow(dead_code)]
pub async fn next_within(client: &mut RelayClient, timeout: Duration) -> Reply {
    tokio::time::timeout(timeout, client.next_response())
        .await
        .expect("timed out waiting for a response")
        .expect("connection failed")
}
