//! Local persisted key-value state.
//!
//! Holds the small amount of state that must survive a restart: the selected
//! group and the login keys cleared when the server revokes the session.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{CareLinkError, CareLinkResult};

/// Well-known keys.
pub mod keys {
    pub const CURRENT_GROUP: &str = "current_group_id";
    pub const LOGIN_USER: &str = "login_user";
    pub const LOGIN_TOKEN: &str = "login_token";
    pub const LOGIN_KEEP: &str = "login_keep";

    /// Keys wiped when the session is revoked.
    pub const SESSION: [&str; 4] = [LOGIN_USER, LOGIN_KEEP, LOGIN_TOKEN, CURRENT_GROUP];
}

/// Persisted string key-value storage.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> CareLinkResult<()>;
    fn remove(&self, key: &str) -> CareLinkResult<()>;
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> CareLinkResult<()> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_owned(), value.to_owned());
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> CareLinkResult<()> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
        Ok(())
    }
}

/// JSON file store. Every mutation is written through to disk.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> CareLinkResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => HashMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => {
                return Err(CareLinkError::Store {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        tracing::debug!(path = %path.display(), keys = entries.len(), "Opened local store");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &HashMap<String, String>) -> CareLinkResult<()> {
        let store_err = |source: std::io::Error| CareLinkError::Store {
            path: self.path.display().to_string(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(store_err)?;
        }
        let raw = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, raw).map_err(store_err)
    }

    fn mutate(&self, f: impl FnOnce(&mut HashMap<String, String>)) -> CareLinkResult<()> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut entries);
        self.flush(&entries)
    }
}

impl LocalStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> CareLinkResult<()> {
        self.mutate(|entries| {
            entries.insert(key.to_owned(), value.to_owned());
        })
    }

    fn remove(&self, key: &str) -> CareLinkResult<()> {
        self.mutate(|entries| {
            entries.remove(key);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_set_get_remove() {
        let store = MemoryStore::new();
        assert!(store.get(keys::CURRENT_GROUP).is_none());
        store.set(keys::CURRENT_GROUP, "g-1").unwrap();
        assert_eq!(store.get(keys::CURRENT_GROUP).as_deref(), Some("g-1"));
        store.remove(keys::CURRENT_GROUP).unwrap();
        assert!(store.get(keys::CURRENT_GROUP).is_none());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = JsonFileStore::open(&path).unwrap();
        store.set(keys::CURRENT_GROUP, "g-7").unwrap();
        store.set(keys::LOGIN_TOKEN, "tk").unwrap();
        store.remove(keys::LOGIN_TOKEN).unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get(keys::CURRENT_GROUP).as_deref(), Some("g-7"));
        assert!(reopened.get(keys::LOGIN_TOKEN).is_none());
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(JsonFileStore::open(&path), Err(CareLinkError::Json(_))));
    }
}
