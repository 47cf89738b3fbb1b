//! Whole-server persistence: one JSON file, loaded at startup and written at
//! shutdown.
//!
//! The file holds the server config, the user directory, the controller-id
//! counter, and per-instance seeds. An instance seed's `state` is either a
//! string (fed through the playset deserializer) or an inline JSON value, the
//! latter being convenient for hand-authored seed files.

use crate::users::UserRecord;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{StatusEntry, FRAME_RATE};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown playset {0}")]
    UnknownPlayset(String),
    #[error("instance {0} state rejected by playset: {1}")]
    BadState(String, serde_json::Error),
}

/// Tunables persisted alongside the world data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub allow_self_serve: bool,
    pub hash_sync_interval: u64,
    pub frame_broadcast_interval: u64,
    pub allowed_origins: Vec<String>,
    pub chat_message_max: usize,
    pub chat_tokens_max: u32,
    pub chat_token_refill_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            allow_self_serve: false,
            hash_sync_interval: 5 * FRAME_RATE,
            frame_broadcast_interval: FRAME_RATE / 4,
            allowed_origins: Vec::new(),
            chat_message_max: 1000,
            chat_tokens_max: 5,
            chat_token_refill_ms: 2000,
        }
    }
}

/// One instance as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSeed {
    pub playset_name: String,
    pub state: StateSeed,
    #[serde(default)]
    pub controller_status: BTreeMap<u32, StatusEntry>,
}

/// Serialized state text, or an inline value for hand-authored seeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateSeed {
    Text(String),
    Inline(Value),
}

/// The whole-server dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub config: ServerConfig,
    #[serde(default)]
    pub users: BTreeMap<String, UserRecord>,
    #[serde(rename = "nextControllerID", default = "first_controller_id")]
    pub next_controller_id: u32,
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceSeed>,
}

fn first_controller_id() -> u32 {
    1
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            config: ServerConfig::default(),
            users: BTreeMap::new(),
            next_controller_id: first_controller_id(),
            instances: BTreeMap::new(),
        }
    }
}

fn timestamp_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Reads the snapshot file; `None` if it does not exist.
pub fn load(path: &Path) -> Result<Option<Snapshot>, SnapshotError> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&text)?))
}

/// Clean shutdown: timestamped backup first, then the canonical path.
pub fn save_clean(snapshot: &Snapshot, path: &Path) -> Result<(), SnapshotError> {
    let text = serde_json::to_string(snapshot)?;
    let backup = timestamped_path(path);
    std::fs::write(&backup, &text)?;
    std::fs::write(path, &text)?;
    info!("saved snapshot to {} (backup {})", path.display(), backup.display());
    Ok(())
}

/// Dirty shutdown: only the timestamped forensic copy; the canonical file is
/// left as it was.
pub fn save_dirty(snapshot: &Snapshot, path: &Path) -> Result<PathBuf, SnapshotError> {
    let text = serde_json::to_string(snapshot)?;
    let forensic = timestamped_path(path);
    std::fs::write(&forensic, &text)?;
    info!("saved forensic snapshot to {}", forensic.display());
    Ok(forensic)
}

fn timestamped_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}.bak", timestamp_ms()));
    PathBuf::from(name)
}
