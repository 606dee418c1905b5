//! Persistent key/value storage, the widget's localStorage analogue.
//!
//! Stored keys are namespaced by widget public token so multiple widgets on
//! one host never share a conversation:
//! `odm.widget.<token>.conversation` and `odm.widget.<token>.visitor`.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Mutex,
};

pub trait WidgetStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

pub fn conversation_key(token: &str) -> String {
    format!("odm.widget.{token}.conversation")
}

pub fn visitor_key(token: &str) -> String {
    format!("odm.widget.{token}.visitor")
}

/// Volatile storage for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WidgetStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .expect("storage mutex poisoned")
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values
            .lock()
            .expect("storage mutex poisoned")
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.values
            .lock()
            .expect("storage mutex poisoned")
            .remove(key);
    }
}

/// JSON-file-backed storage surviving process restarts, mirroring how the
/// browser build keeps state across page reloads. Write failures are logged
/// rather than surfaced; storage loss only costs a resumption.
pub struct FileStorage {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileStorage {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    fn persist(&self, values: &HashMap<String, String>) {
        match serde_json::to_string_pretty(values) {
            Ok(serialized) => {
                if let Err(err) = std::fs::write(&self.path, serialized) {
                    tracing::warn!(path = %self.path.display(), "failed to persist widget storage: {err}");
                }
            }
            Err(err) => tracing::warn!("failed to serialize widget storage: {err}"),
        }
    }
}

impl WidgetStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .expect("storage mutex poisoned")
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut guard = self.values.lock().expect("storage mutex poisoned");
        guard.insert(key.to_string(), value.to_string());
        self.persist(&guard);
    }

    fn remove(&self, key: &str) {
        let mut guard = self.values.lock().expect("storage mutex poisoned");
        guard.remove(key);
        self.persist(&guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_token() {
        assert_eq!(
            conversation_key("tok_1"),
            "odm.widget.tok_1.conversation"
        );
        assert_ne!(conversation_key("a"), conversation_key("b"));
    }

    #[test]
    fn file_storage_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("widget.json");
        {
            let storage = FileStorage::open(&path);
            storage.set("odm.widget.t.conversation", "conv-1");
        }
        let reopened = FileStorage::open(&path);
        assert_eq!(
            reopened.get("odm.widget.t.conversation").as_deref(),
            Some("conv-1")
        );
        reopened.remove("odm.widget.t.conversation");
        assert!(reopened.get("odm.widget.t.conversation").is_none());
    }
}
