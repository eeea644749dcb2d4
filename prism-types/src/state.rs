//! Per-node persisted state: a directory of small JSON documents keyed by
//! name (`server_db.json`, `lsp.json`). State is written after every
//! successful mutation so a restarted process resumes where it left off.

use std::fs;
use std::path::PathBuf;

use serde_json::Value;

/// A key → JSON document store rooted at a directory. A store without a
/// root directory accepts writes and drops them, which is what short-lived
/// test nodes use.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: Option<PathBuf>,
}

impl StateStore {
    /// A store persisting under `root`. The directory is created lazily on
    /// first save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// A store that never touches the filesystem.
    pub fn ephemeral() -> Self {
        Self { root: None }
    }

    fn path_for(&self, key: &str) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(format!("{key}.json")))
    }

    /// Persist `state` under `key`, replacing any previous document.
    pub fn save_state(&self, key: &str, state: &Value) {
        let Some(path) = self.path_for(key) else {
            return;
        };
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_vec_pretty(state)?;
            fs::write(&path, json)
        };
        if let Err(err) = write() {
            tracing::warn!("could not persist state {key}: {err}");
        }
    }

    /// Load the document stored under `key`, if any.
    pub fn load_state(&self, key: &str) -> Option<Value> {
        let path = self.path_for(key)?;
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!("discarding corrupt state {key}: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_documents() {
        let dir = std::env::temp_dir().join(format!("prism-state-{}", std::process::id()));
        let store = StateStore::new(&dir);
        let doc = serde_json::json!({"servers": [{"ark": "aGk=", "last_broadcast": 0}]});
        store.save_state("server_db", &doc);
        assert_eq!(store.load_state("server_db"), Some(doc));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn ephemeral_store_drops_writes() {
        let store = StateStore::ephemeral();
        store.save_state("lsp", &serde_json::json!({}));
        assert!(store.load_state("lsp").is_none());
    }
}
