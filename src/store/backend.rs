//! Document store backends
//!
//! The gateway talks to a [`DocumentStore`]: a collection/id keyed JSON
//! document interface. Production uses [`JsonFileStore`], one file per
//! document under the data directory; tests use [`MemoryStore`].

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Errors surfaced by a document store backend
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("I/O failure for {collection}/{id}: {source}")]
    Io {
        collection: String,
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt document {collection}/{id}: {0}", collection = .1, id = .2)]
    Corrupt(serde_json::Error, String, String),
}

/// A collection/id keyed JSON document store.
///
/// The real deployment backs this with a document database; the pinned
/// contract is only what the gateway needs: whole-document put/get/delete
/// and a full-collection scan for startup hydration.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<(), BackendError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, BackendError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, BackendError>;

    /// All documents in a collection, keyed by id.
    async fn scan(&self, collection: &str) -> Result<HashMap<String, Value>, BackendError>;
}

/// One JSON file per document under `{root}/{collection}/{id}.json`.
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn doc_path(&self, collection: &str, id: &str) -> PathBuf {
        self.root.join(collection).join(format!("{id}.json"))
    }

    fn io_err(collection: &str, id: &str, source: std::io::Error) -> BackendError {
        BackendError::Io {
            collection: collection.to_string(),
            id: id.to_string(),
            source,
        }
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<(), BackendError> {
        let path = self.doc_path(collection, id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_err(collection, id, e))?;
        }

        let content = serde_json::to_vec_pretty(&doc)
            .map_err(|e| BackendError::Corrupt(e, collection.to_string(), id.to_string()))?;

        // Write-then-rename so readers never observe a torn document.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| Self::io_err(collection, id, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::io_err(collection, id, e))?;

        debug!(collection, id, "document written");
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, BackendError> {
        let path = self.doc_path(collection, id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let doc = serde_json::from_slice(&bytes).map_err(|e| {
                    BackendError::Corrupt(e, collection.to_string(), id.to_string())
                })?;
                Ok(Some(doc))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_err(collection, id, e)),
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, BackendError> {
        let path = self.doc_path(collection, id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io_err(collection, id, e)),
        }
    }

    async fn scan(&self, collection: &str) -> Result<HashMap<String, Value>, BackendError> {
        let dir = self.root.join(collection);
        let mut out = HashMap::new();

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(Self::io_err(collection, "*", e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_err(collection, "*", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(doc) => {
                        out.insert(id, doc);
                    }
                    Err(e) => {
                        // A corrupt document must not block startup; it is
                        // skipped loudly and left on disk for inspection.
                        warn!(collection, id, error = %e, "skipping corrupt document");
                    }
                },
                Err(e) => return Err(Self::io_err(collection, &id, e)),
            }
        }

        Ok(out)
    }
}

/// In-memory backend for tests.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<(), BackendError> {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, BackendError> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, BackendError> {
        Ok(self
            .collections
            .write()
            .await
            .get_mut(collection)
            .map(|c| c.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn scan(&self, collection: &str) -> Result<HashMap<String, Value>, BackendError> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());

        store
            .put("nodes", "n1", json!({"id": "n1", "name": "alpha"}))
            .await
            .unwrap();

        let doc = store.get("nodes", "n1").await.unwrap().unwrap();
        assert_eq!(doc["name"], "alpha");

        assert!(store.delete("nodes", "n1").await.unwrap());
        assert!(store.get("nodes", "n1").await.unwrap().is_none());
        assert!(!store.delete("nodes", "n1").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_store_scan_skips_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());

        store.put("vms", "good", json!({"ok": true})).await.unwrap();
        std::fs::write(dir.path().join("vms").join("bad.json"), "not json").unwrap();

        let all = store.scan("vms").await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("good"));
    }

    #[tokio::test]
    async fn test_file_store_scan_missing_collection() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.scan("nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.put("users", "u1", json!({"id": "u1"})).await.unwrap();
        assert!(store.get("users", "u1").await.unwrap().is_some());
        let all = store.scan("users").await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
