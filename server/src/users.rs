//! User directory: accounts, credentials, per-user config.
//!
//! Passwords are stored as hex SHA-256 over salt-then-password with a random
//! per-user salt. The directory is owned by the server loop; nothing here is
//! shared across tasks.

use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A persisted account record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub hash: String,
    pub salt: String,
    #[serde(default)]
    pub config: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_serve_origin: Option<String>,
}

/// ASCII alphanumeric, not starting with a digit, 3-16 chars.
pub fn valid_username(name: &str) -> bool {
    (3..=16).contains(&name.len())
        && name.chars().all(|c| c.is_ascii_alphanumeric())
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn password_hash(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex(&hasher.finalize())
}

fn fresh_salt() -> String {
    hex(&rand::random::<[u8; 16]>())
}

/// All accounts known to the server.
#[derive(Debug, Default)]
pub struct UserDirectory {
    users: BTreeMap<String, UserRecord>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(users: BTreeMap<String, UserRecord>) -> Self {
        Self { users }
    }

    /// The persisted form, for snapshots.
    pub fn records(&self) -> &BTreeMap<String, UserRecord> {
        &self.users
    }

    /// Creates an account, validating the username shape, uniqueness, and a
    /// non-empty password.
    pub fn create(
        &mut self,
        username: &str,
        password: &str,
        config: String,
        admin: bool,
        self_serve_origin: Option<String>,
    ) -> Result<(), ClientError> {
        if !valid_username(username) {
            return Err(ClientError::InvalidUsername);
        }
        if password.is_empty() {
            return Err(ClientError::InvalidPassword);
        }
        if self.users.contains_key(username) {
            return Err(ClientError::UsernameTaken);
        }
        let salt = fresh_salt();
        let hash = password_hash(&salt, password);
        self.users.insert(
            username.to_string(),
            UserRecord {
                hash,
                salt,
                config,
                admin,
                self_serve_origin,
            },
        );
        Ok(())
    }

    /// Checks credentials, yielding the record on success.
    pub fn verify(&self, username: &str, password: &str) -> Option<&UserRecord> {
        let record = self.users.get(username)?;
        if password_hash(&record.salt, password) == record.hash {
            Some(record)
        } else {
            None
        }
    }

    /// Re-salts and stores a new password for an existing account.
    pub fn set_password(&mut self, username: &str, new_password: &str) -> Result<(), ClientError> {
        if new_password.is_empty() {
            return Err(ClientError::InvalidPassword);
        }
        let record = self
            .users
            .get_mut(username)
            .ok_or(ClientError::BadCredentials)?;
        record.salt = fresh_salt();
        record.hash = password_hash(&record.salt, new_password);
        Ok(())
    }

    pub fn set_config(&mut self, username: &str, config: String) -> Result<(), ClientError> {
        let record = self
            .users
            .get_mut(username)
            .ok_or(ClientError::BadCredentials)?;
        record.config = config;
        Ok(())
    }

    pub fn config(&self, username: &str) -> Option<&str> {
        self.users.get(username).map(|r| r.config.as_str())
    }
}
