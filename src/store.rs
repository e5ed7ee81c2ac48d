//! Append-only JSON persistence.
//!
//! One JSON array file per record kind. Saves write the full array to a
//! temporary file in the same directory and rename it over the target, so a
//! reader observes either the previous or the new contents, never a torn
//! file. A read failure on startup yields the empty sequence (fresh replica);
//! a write failure is the caller's to log and swallow, the in-memory state
//! stays authoritative until the next flush succeeds.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::record::{ChannelRecord, LoginRecord, MessageRecord};

/// The three replicated record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Logins,
    Channels,
    Messages,
}

impl Kind {
    pub const ALL: [Kind; 3] = [Kind::Logins, Kind::Channels, Kind::Messages];

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Logins => "logins",
            Kind::Channels => "channels",
            Kind::Messages => "messages",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "logins" => Some(Kind::Logins),
            "channels" => Some(Kind::Channels),
            "messages" => Some(Kind::Messages),
            _ => None,
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            Kind::Logins => "logins.json",
            Kind::Channels => "channels.json",
            Kind::Messages => "messages.json",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("data dir init failed for {path}: {source}")]
    Init {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("write failed for {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialize failed for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// File-backed datastore for one replica.
pub struct DataStore {
    data_dir: PathBuf,
    replication_dir: PathBuf,
}

impl DataStore {
    /// Open (and create if needed) the data directory and its `replication/`
    /// diagnostics subdirectory.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        let replication_dir = data_dir.join("replication");
        std::fs::create_dir_all(&replication_dir).map_err(|source| StoreError::Init {
            path: replication_dir.clone(),
            source,
        })?;
        Ok(Self {
            data_dir,
            replication_dir,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn load_logins(&self) -> Vec<LoginRecord> {
        self.load_seq(Kind::Logins.file_name())
    }

    pub fn load_channels(&self) -> Vec<ChannelRecord> {
        self.load_seq(Kind::Channels.file_name())
    }

    pub fn load_messages(&self) -> Vec<MessageRecord> {
        self.load_seq(Kind::Messages.file_name())
    }

    pub fn save_logins(&self, records: &[LoginRecord]) -> Result<(), StoreError> {
        self.save_json(Kind::Logins.file_name(), &records)
    }

    pub fn save_channels(&self, records: &[ChannelRecord]) -> Result<(), StoreError> {
        self.save_json(Kind::Channels.file_name(), &records)
    }

    pub fn save_messages(&self, records: &[MessageRecord]) -> Result<(), StoreError> {
        self.save_json(Kind::Messages.file_name(), &records)
    }

    pub fn append_login(&self, record: &LoginRecord) -> Result<(), StoreError> {
        let mut records = self.load_logins();
        records.push(record.clone());
        self.save_logins(&records)
    }

    pub fn append_channel(&self, record: &ChannelRecord) -> Result<(), StoreError> {
        let mut records = self.load_channels();
        records.push(record.clone());
        self.save_channels(&records)
    }

    /// Write a diagnostic document under `replication/<name>.json`.
    ///
    /// These are never read back by the state machine.
    pub fn save_diagnostic<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let path = self.replication_dir.join(format!("{name}.json"));
        write_atomic(&self.replication_dir, &path, value)
    }

    /// Load an arbitrary JSON document from the data directory; `None` when
    /// absent or unreadable.
    pub fn load_document<T: DeserializeOwned>(&self, file_name: &str) -> Option<T> {
        let path = self.data_dir.join(file_name);
        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(path = %path.display(), "corrupt document ignored: {err}");
                None
            }
        }
    }

    /// Atomically replace an arbitrary JSON document in the data directory.
    pub fn save_document<T: Serialize>(&self, file_name: &str, value: &T) -> Result<(), StoreError> {
        let path = self.data_dir.join(file_name);
        write_atomic(&self.data_dir, &path, value)
    }

    fn load_seq<T: DeserializeOwned>(&self, file_name: &str) -> Vec<T> {
        let path = self.data_dir.join(file_name);
        if !path.exists() {
            return Vec::new();
        }
        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(records) => records,
                Err(err) => {
                    tracing::warn!(path = %path.display(), "corrupt record file, starting empty: {err}");
                    Vec::new()
                }
            },
            Err(err) => {
                tracing::warn!(path = %path.display(), "record file unreadable, starting empty: {err}");
                Vec::new()
            }
        }
    }

    fn save_json<T: Serialize>(&self, file_name: &str, value: &T) -> Result<(), StoreError> {
        let path = self.data_dir.join(file_name);
        write_atomic(&self.data_dir, &path, value)
    }
}

fn write_atomic<T: Serialize>(dir: &Path, path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    tmp.write_all(&bytes).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    tmp.persist(path).map_err(|err| StoreError::Write {
        path: path.to_path_buf(),
        source: err.error,
    })?;
    Ok(())
}
