//! Durable storage for queued outbound messages
//!
//! The queue only needs atomic get/put/delete by key, so the contract is a tiny
//! key/value trait keyed by tempId. `JsonFileStore` keeps one JSON record per
//! entry and replaces files atomically; `MemoryStore` backs tests and
//! ephemeral sessions.

use log::{debug, warn};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use crate::models::QueuedMessage;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub trait QueueStore: Send + Sync {
    fn get(&self, temp_id: &str) -> Result<Option<QueuedMessage>, StoreError>;

    fn put(&self, entry: &QueuedMessage) -> Result<(), StoreError>;

    fn delete(&self, temp_id: &str) -> Result<(), StoreError>;

    /// Every stored entry, in no particular order.
    fn load_all(&self) -> Result<Vec<QueuedMessage>, StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, QueuedMessage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, QueuedMessage>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl QueueStore for MemoryStore {
    fn get(&self, temp_id: &str) -> Result<Option<QueuedMessage>, StoreError> {
        Ok(self.entries().get(temp_id).cloned())
    }

    fn put(&self, entry: &QueuedMessage) -> Result<(), StoreError> {
        self.entries().insert(entry.temp_id.clone(), entry.clone());
        Ok(())
    }

    fn delete(&self, temp_id: &str) -> Result<(), StoreError> {
        self.entries().remove(temp_id);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<QueuedMessage>, StoreError> {
        Ok(self.entries().values().cloned().collect())
    }
}

/// One `<tempId>.json` file per queued message in a directory.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        Ok(Self { dir })
    }

    /// `<data dir>/chatsync/outbox`
    pub fn open_default() -> Result<Self, StoreError> {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::open(base.join("chatsync").join("outbox"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, temp_id: &str) -> PathBuf {
        // tempIds are client generated, keep them from escaping the directory
        let safe: String = temp_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

impl QueueStore for JsonFileStore {
    fn get(&self, temp_id: &str) -> Result<Option<QueuedMessage>, StoreError> {
        let path = self.path_for(temp_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn put(&self, entry: &QueuedMessage) -> Result<(), StoreError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer(&mut tmp, entry)?;
        tmp.flush()?;
        tmp.persist(self.path_for(&entry.temp_id))
            .map_err(|e| StoreError::Io(e.error))?;
        debug!("Persisted queue entry {}", entry.temp_id);
        Ok(())
    }

    fn delete(&self, temp_id: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(temp_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_all(&self) -> Result<Vec<QueuedMessage>, StoreError> {
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = fs::read_to_string(&path)?;
            match serde_json::from_str::<QueuedMessage>(&contents) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping unreadable queue entry {}: {}", path.display(), e),
            }
        }
        Ok(entries)
    }
}
