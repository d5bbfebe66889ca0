//! Hamchat Crypto -- salted scrypt credential hashing.
//!
//! Stored credential format (one whitespace-free token):
//!
//! ```text
//! scrypt$<log_n>$<salt hex>$<key hex>
//! ```
//!
//! r=8, p=1, 32-byte salt, 32-byte derived key. `log_n` is recorded per
//! credential so the cost can be raised without invalidating old entries.

use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use std::fmt;
use std::str::FromStr;

/// Production cost: 2^14 = 16384.
pub const DEFAULT_LOG_N: u8 = 14;
/// Highest accepted cost parameter.
pub const MAX_LOG_N: u8 = 20;

const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const KEY_LENGTH: usize = 32;
const SALT_LENGTH: usize = 32;
const SCHEME: &str = "scrypt";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),
    #[error("system RNG failure")]
    RngFailure,
    #[error("invalid credential encoding: {0}")]
    InvalidEncoding(String),
    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Derive a 256-bit key from password + salt using scrypt.
pub fn derive_key(
    password: &[u8],
    salt: &[u8],
    log_n: u8,
) -> Result<[u8; KEY_LENGTH], CryptoError> {
    if log_n == 0 || log_n > MAX_LOG_N {
        return Err(CryptoError::KeyDerivationFailed(format!(
            "log_n {log_n} outside 1..={MAX_LOG_N}"
        )));
    }
    let params = scrypt::Params::new(log_n, SCRYPT_R, SCRYPT_P, KEY_LENGTH)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

    let mut key = [0u8; KEY_LENGTH];
    scrypt::scrypt(password, salt, &params, &mut key)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

    Ok(key)
}

/// Generate a random salt (32 bytes).
pub fn generate_salt() -> Result<[u8; SALT_LENGTH], CryptoError> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LENGTH];
    rng.fill(&mut salt).map_err(|_| CryptoError::RngFailure)?;
    Ok(salt)
}

/// Hashes new passwords at a fixed cost.
#[derive(Debug, Clone, Copy)]
pub struct PasswordHasher {
    log_n: u8,
}

impl PasswordHasher {
    pub fn new(log_n: u8) -> Self {
        Self { log_n }
    }

    pub fn log_n(&self) -> u8 {
        self.log_n
    }

    pub fn hash(&self, password: &str) -> Result<PasswordHash, CryptoError> {
        let salt = generate_salt()?;
        let key = derive_key(password.as_bytes(), &salt, self.log_n)?;
        Ok(PasswordHash {
            log_n: self.log_n,
            salt: salt.to_vec(),
            key,
        })
    }
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_N)
    }
}

/// A stored, salted credential.
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordHash {
    log_n: u8,
    salt: Vec<u8>,
    key: [u8; KEY_LENGTH],
}

impl PasswordHash {
    /// True if `password` derives the stored key.
    pub fn verify(&self, password: &str) -> Result<bool, CryptoError> {
        let candidate = derive_key(password.as_bytes(), &self.salt, self.log_n)?;
        keys_match(&candidate, &self.key)
    }

    pub fn log_n(&self) -> u8 {
        self.log_n
    }

    /// Cheap check for the `scrypt$` prefix, used to tell hashed entries
    /// from legacy plaintext ones.
    pub fn looks_encoded(token: &str) -> bool {
        token
            .strip_prefix(SCHEME)
            .is_some_and(|rest| rest.starts_with('$'))
    }
}

impl fmt::Display for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{SCHEME}${}${}${}",
            self.log_n,
            hex::encode(&self.salt),
            hex::encode(self.key)
        )
    }
}

impl fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material
        f.debug_struct("PasswordHash")
            .field("log_n", &self.log_n)
            .finish_non_exhaustive()
    }
}

impl FromStr for PasswordHash {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('$');
        let (Some(scheme), Some(log_n), Some(salt), Some(key), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(CryptoError::InvalidEncoding("expected 4 '$'-separated fields".into()));
        };

        if scheme != SCHEME {
            return Err(CryptoError::InvalidEncoding(format!("unknown scheme {scheme:?}")));
        }
        let log_n: u8 = log_n
            .parse()
            .map_err(|_| CryptoError::InvalidEncoding(format!("bad log_n {log_n:?}")))?;
        if log_n == 0 || log_n > MAX_LOG_N {
            return Err(CryptoError::InvalidEncoding(format!("log_n {log_n} out of range")));
        }
        let salt = hex::decode(salt)?;
        if salt.is_empty() {
            return Err(CryptoError::InvalidEncoding("empty salt".into()));
        }
        let key: [u8; KEY_LENGTH] = hex::decode(key)?
            .try_into()
            .map_err(|_| CryptoError::InvalidEncoding("derived key must be 32 bytes".into()))?;

        Ok(Self { log_n, salt, key })
    }
}

/// Compare two derived keys without leaking where they differ. Both sides
/// are MACed under a one-off key and `hmac::verify` checks the tags in
/// constant time.
fn keys_match(candidate: &[u8], stored: &[u8]) -> Result<bool, CryptoError> {
    let rng = SystemRandom::new();
    let key =
        hmac::Key::generate(hmac::HMAC_SHA256, &rng).map_err(|_| CryptoError::RngFailure)?;
    let tag = hmac::sign(&key, stored);
    Ok(hmac::verify(&key, candidate, tag.as_ref()).is_ok())
}
