//! Key-value persistence surviving restarts.
//!
//! Holds exactly three things: the session credential, an auxiliary session
//! id, and the active tour id. Nothing else in this crate is persisted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

/// Well-known keys. Other modules use these rather than bare strings.
pub mod keys {
    pub const CREDENTIAL: &str = "credential";
    pub const SESSION_ID: &str = "sessionId";
    pub const ACTIVE_TOUR: &str = "activeTourId";
}

/// String key-value store surviving restarts.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// File-backed store: a single JSON object rewritten on every mutation.
/// Write failures are logged and tolerated; losing a persisted credential
/// degrades to a fresh sign-in, never to corrupt state.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<BTreeMap<String, String>>(&contents) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), "discarding unreadable session file: {}", e);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };

        Self { path, entries: Mutex::new(entries) }
    }

    fn flush(&self, entries: &BTreeMap<String, String>) {
        let contents = match serde_json::to_string_pretty(entries) {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to serialize session file: {}", e);
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.path, contents) {
            warn!(path = %self.path.display(), "failed to write session file: {}", e);
        }
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries);
    }

    fn remove(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        self.flush(&entries);
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        {
            let store = FileStore::open(&path);
            store.set(keys::CREDENTIAL, "tok-123");
            store.set(keys::SESSION_ID, "sess-1");
        }

        let reopened = FileStore::open(&path);
        assert_eq!(reopened.get(keys::CREDENTIAL).as_deref(), Some("tok-123"));
        assert_eq!(reopened.get(keys::SESSION_ID).as_deref(), Some("sess-1"));

        reopened.remove(keys::CREDENTIAL);
        let reopened_again = FileStore::open(&path);
        assert_eq!(reopened_again.get(keys::CREDENTIAL), None);
        assert_eq!(reopened_again.get(keys::SESSION_ID).as_deref(), Some("sess-1"));
    }

    #[test]
    fn file_store_tolerates_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "not json at all").unwrap();

        let store = FileStore::open(&path);
        assert_eq!(store.get(keys::CREDENTIAL), None);
        store.set(keys::CREDENTIAL, "tok");
        assert_eq!(store.get(keys::CREDENTIAL).as_deref(), Some("tok"));
    }
}
