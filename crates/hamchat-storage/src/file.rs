//! Flat-file backends.
//!
//! `AccountFile`: one account per line, `username credential`, replaced
//! atomically (temp file + rename) on every save.
//! `HistoryFile`: one JSON object per line, appended and synced.

use hamchat_crypto::PasswordHash;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::history::ChatMessage;
use crate::{AccountBackend, AccountRecord, HistoryBackend, Result, StorageError, StoredCredential};

fn open_existing(path: &Path) -> Result<Option<File>> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct AccountFile {
    path: PathBuf,
}

impl AccountFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse_line(&self, line_no: usize, line: &str) -> Result<Option<AccountRecord>> {
        let mut tokens = line.split_whitespace();
        let Some(username) = tokens.next() else {
            return Ok(None);
        };
        let (Some(credential), None) = (tokens.next(), tokens.next()) else {
            return Err(StorageError::Corrupt {
                path: self.path.clone(),
                line: line_no,
                reason: "expected `username credential`".into(),
            });
        };

        let credential = if PasswordHash::looks_encoded(credential) {
            let hash = credential.parse().map_err(|e| StorageError::Corrupt {
                path: self.path.clone(),
                line: line_no,
                reason: format!("{e}"),
            })?;
            StoredCredential::Hashed(hash)
        } else {
            StoredCredential::Legacy(credential.to_string())
        };

        Ok(Some(AccountRecord {
            username: username.to_string(),
            credential,
        }))
    }
}

impl AccountBackend for AccountFile {
    fn load(&self) -> Result<Vec<AccountRecord>> {
        let Some(file) = open_existing(&self.path)? else {
            tracing::info!(path = %self.path.display(), "accounts: no file yet, starting empty");
            return Ok(Vec::new());
        };

        let mut records = Vec::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            if let Some(record) = self.parse_line(i + 1, &line?)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn save(&self, accounts: &[AccountRecord]) -> Result<()> {
        ensure_parent(&self.path)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        {
            let mut file = File::create(&tmp)?;
            for account in accounts {
                match &account.credential {
                    StoredCredential::Hashed(hash) => {
                        writeln!(file, "{} {hash}", account.username)?
                    }
                    StoredCredential::Legacy(password) => {
                        writeln!(file, "{} {password}", account.username)?
                    }
                }
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HistoryFile {
    path: PathBuf,
}

impl HistoryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistoryBackend for HistoryFile {
    fn load(&self) -> Result<Vec<ChatMessage>> {
        let Some(file) = open_existing(&self.path)? else {
            return Ok(Vec::new());
        };

        let mut messages = Vec::new();
        let mut legacy = 0usize;
        for line in BufReader::new(file).lines() {
            let line = line?;
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<ChatMessage>(trimmed) {
                Ok(message) => messages.push(message),
                Err(_) => {
                    // Older servers stored the raw message text only
                    legacy += 1;
                    messages.push(ChatMessage {
                        sender: String::new(),
                        recipient: String::new(),
                        body: trimmed.to_string(),
                        logged_at: None,
                    });
                }
            }
        }
        if legacy > 0 {
            tracing::warn!(
                legacy,
                path = %self.path.display(),
                "history: loaded body-only legacy entries"
            );
        }
        Ok(messages)
    }

    fn append(&self, message: &ChatMessage) -> Result<()> {
        ensure_parent(&self.path)?;
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }
}
