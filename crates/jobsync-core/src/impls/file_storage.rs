//! FileStorage - a JSON file standing in for client-side storage.
//!
//! Used by the CLI so that `resume` in a later process finds the id a previous
//! `start` persisted. The whole map is rewritten on every mutation.
//!
//! Only one process is assumed to write at a time, so the change feed never
//! reports anything.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::ports::{ChangeFeed, ContextId, PersistenceAdapter, StorageEvent};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path} is not a storage file: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub struct FileStorage {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
    changes: broadcast::Sender<StorageEvent>,
    origin: ContextId,
}

impl FileStorage {
    /// Load `path`, starting empty if it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| StorageError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        tracing::debug!(path = %path.display(), keys = values.len(), "storage file loaded");

        let (changes, _) = broadcast::channel(1);
        Ok(Self {
            path,
            values: Mutex::new(values),
            changes,
            origin: ContextId::generate(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the whole map. The caller rolls its change back on failure so
    /// memory never claims more than the file holds.
    fn flush(&self, key: &str, values: &BTreeMap<String, String>) -> io::Result<()> {
        let write = || -> io::Result<()> {
            if let Some(parent) = self.path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)?;
            }
            let body = serde_json::to_string_pretty(values).map_err(io::Error::other)?;
            fs::write(&self.path, body)
        };
        write().inspect_err(|err| {
            tracing::error!(
                key,
                path = %self.path.display(),
                error = %err,
                "failed to write storage file; change not persisted"
            );
        })
    }
}

impl PersistenceAdapter for FileStorage {
    fn set(&self, key: &str, value: &str) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        let previous = values.insert(key.to_string(), value.to_string());
        if self.flush(key, &values).is_err() {
            match previous {
                Some(previous) => values.insert(key.to_string(), previous),
                None => values.remove(key),
            };
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }

    fn clear(&self, key: &str) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = values.remove(key)
            && self.flush(key, &values).is_err()
        {
            values.insert(key.to_string(), previous);
        }
    }

    fn external_changes(&self) -> ChangeFeed {
        ChangeFeed::new(self.changes.subscribe(), self.origin)
    }
}
