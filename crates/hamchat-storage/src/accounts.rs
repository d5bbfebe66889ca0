//! Account store -- bounded, unique usernames, hashed credentials.

use hamchat_crypto::{PasswordHash, PasswordHasher};
use std::sync::{Mutex, MutexGuard};

use crate::{AccountBackend, AccountRecord, StorageError, StoredCredential};

/// Default table size (matches the relay's historical limit).
pub const DEFAULT_MAX_ACCOUNTS: usize = 10;

/// Longest accepted username or password, in bytes.
pub const MAX_CREDENTIAL_LEN: usize = 255;

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("username {0:?} is already taken")]
    UsernameTaken(String),
    #[error("account table is full ({capacity} accounts)")]
    CapacityExceeded { capacity: usize },
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
struct Account {
    username: String,
    credential: PasswordHash,
}

impl Account {
    fn record(&self) -> AccountRecord {
        AccountRecord {
            username: self.username.clone(),
            credential: StoredCredential::Hashed(self.credential.clone()),
        }
    }
}

/// In-memory account table persisted through an [`AccountBackend`].
pub struct AccountStore {
    accounts: Mutex<Vec<Account>>,
    backend: Box<dyn AccountBackend>,
    hasher: PasswordHasher,
    /// Checked against on unknown usernames so a miss costs as much as a hit.
    decoy: PasswordHash,
    capacity: usize,
}

impl AccountStore {
    /// Load the table from `backend`. Legacy clear-text entries are hashed
    /// and the table is written back before this returns.
    pub fn open(
        backend: Box<dyn AccountBackend>,
        hasher: PasswordHasher,
        capacity: usize,
    ) -> Result<Self, StorageError> {
        let records = backend.load()?;
        let mut accounts: Vec<Account> = Vec::with_capacity(records.len());
        let mut migrated = 0usize;

        for record in records {
            if accounts.iter().any(|a| a.username == record.username) {
                tracing::warn!(username = %record.username, "accounts: duplicate entry ignored");
                continue;
            }
            let credential = match record.credential {
                StoredCredential::Hashed(hash) => hash,
                StoredCredential::Legacy(password) => {
                    migrated += 1;
                    hasher.hash(&password)?
                }
            };
            accounts.push(Account {
                username: record.username,
                credential,
            });
        }

        if migrated > 0 {
            let records: Vec<AccountRecord> = accounts.iter().map(Account::record).collect();
            backend.save(&records)?;
            tracing::warn!(migrated, "accounts: hashed legacy clear-text passwords");
        }

        tracing::info!(accounts = accounts.len(), capacity, "accounts: loaded");

        let decoy = hasher.hash("hamchat-decoy")?;
        Ok(Self {
            accounts: Mutex::new(accounts),
            backend,
            hasher,
            decoy,
            capacity,
        })
    }

    fn table(&self) -> Result<MutexGuard<'_, Vec<Account>>, StorageError> {
        self.accounts.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn check_room(&self, accounts: &[Account], username: &str) -> Result<(), AccountError> {
        if accounts.iter().any(|a| a.username == username) {
            return Err(AccountError::UsernameTaken(username.to_string()));
        }
        if accounts.len() >= self.capacity {
            return Err(AccountError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Create an account. The table is persisted before this returns `Ok`;
    /// if persisting fails the new entry is rolled back.
    pub fn register(&self, username: &str, password: &str) -> Result<(), AccountError> {
        validate(username, password)?;

        // Fail fast before paying for the hash.
        self.check_room(&self.table()?, username)?;

        let credential = self.hasher.hash(password).map_err(StorageError::from)?;

        let mut accounts = self.table()?;
        // Re-check: another registration may have won the race while hashing.
        self.check_room(&accounts, username)?;

        accounts.push(Account {
            username: username.to_string(),
            credential,
        });
        let records: Vec<AccountRecord> = accounts.iter().map(Account::record).collect();
        if let Err(e) = self.backend.save(&records) {
            accounts.pop();
            tracing::error!(%username, "accounts: save failed, registration rolled back: {e}");
            return Err(e.into());
        }

        tracing::info!(%username, accounts = accounts.len(), "accounts: registered");
        Ok(())
    }

    /// True only for an exact username whose stored credential matches.
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        let credential = match self.table() {
            Ok(accounts) => accounts
                .iter()
                .find(|a| a.username == username)
                .map(|a| a.credential.clone()),
            Err(e) => {
                tracing::error!("accounts: {e}");
                return false;
            }
        };

        let Some(credential) = credential else {
            // Same KDF work as a real check; the result is ignored.
            let _ = self.decoy.verify(password);
            return false;
        };

        match credential.verify(password) {
            Ok(ok) => ok,
            Err(e) => {
                tracing::error!(%username, "accounts: credential check failed: {e}");
                false
            }
        }
    }

    pub fn contains(&self, username: &str) -> bool {
        self.table()
            .map(|accounts| accounts.iter().any(|a| a.username == username))
            .unwrap_or(false)
    }

    pub fn usernames(&self) -> Vec<String> {
        self.table()
            .map(|accounts| accounts.iter().map(|a| a.username.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.table().map(|accounts| accounts.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn validate(username: &str, password: &str) -> Result<(), AccountError> {
    if username.is_empty() {
        return Err(AccountError::InvalidCredentials("username is empty".into()));
    }
    if password.is_empty() {
        return Err(AccountError::InvalidCredentials("password is empty".into()));
    }
    if username.len() > MAX_CREDENTIAL_LEN || password.len() > MAX_CREDENTIAL_LEN {
        return Err(AccountError::InvalidCredentials(format!(
            "username and password are limited to {MAX_CREDENTIAL_LEN} bytes"
        )));
    }
    if username.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(AccountError::InvalidCredentials(
            "username may not contain whitespace".into(),
        ));
    }
    Ok(())
}
