//! Persisted key-value store for session state and cached materials.
//!
//! Keys are chain-scoped strings; values are small string blobs (JSON or
//! hex). The store is append/overwrite-only and every key family has a
//! single logical writer, so readers treat a racing miss as "not yet
//! cached", never as corruption.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Failures raised by a [`SessionStore`] backend.
#[derive(Clone, Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(String),
    #[error("storage serialization error: {0}")]
    Serialization(String),
}

/// Durable string-to-string mapping that survives process restarts.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// MEMORY STORE
// ═══════════════════════════════════════════════════════════════════════════════

/// Ephemeral in-process store for tests and throwaway sessions.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.write().await.remove(key);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FILE STORE
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable store backed by a single JSON document on disk.
///
/// Writes rewrite the whole document under an in-process mutex; concurrent
/// processes race with last-write-wins, which callers must tolerate.
pub struct FileStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_map(&self) -> Result<HashMap<String, String>, StorageError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| StorageError::Serialization(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }

    async fn store_map(&self, map: &HashMap<String, String>) -> Result<(), StorageError> {
        let contents = serde_json::to_string(map)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::Io(e.to_string()))?;
            }
        }
        tokio::fs::write(&self.path, contents)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.load_map().await?.remove(key))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.load_map().await?;
        map.insert(key.to_string(), value.to_string());
        self.store_map(&map).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.load_map().await?;
        if map.remove(key).is_some() {
            self.store_map(&map).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_FILE_SEQ: AtomicU64 = AtomicU64::new(0);

    fn test_file_path() -> PathBuf {
        let seq = TEST_FILE_SEQ.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!(
            "fhes-store-test-{}-{}.json",
            std::process::id(),
            seq
        ))
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("wallet.connected").await.unwrap(), None);

        store.put("wallet.connected", "true").await.unwrap();
        assert_eq!(
            store.get("wallet.connected").await.unwrap(),
            Some("true".to_string())
        );

        store.delete("wallet.connected").await.unwrap();
        assert_eq!(store.get("wallet.connected").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let path = test_file_path();
        {
            let store = FileStore::new(&path);
            store.put("wallet.lastChainId", "0x7a69").await.unwrap();
            store.put("wallet.lastConnectorId", "io.metamask").await.unwrap();
        }

        let reopened = FileStore::new(&path);
        assert_eq!(
            reopened.get("wallet.lastChainId").await.unwrap(),
            Some("0x7a69".to_string())
        );

        reopened.delete("wallet.lastChainId").await.unwrap();
        assert_eq!(reopened.get("wallet.lastChainId").await.unwrap(), None);
        assert_eq!(
            reopened.get("wallet.lastConnectorId").await.unwrap(),
            Some("io.metamask".to_string())
        );

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn file_store_missing_file_reads_empty() {
        let store = FileStore::new(test_file_path());
        assert_eq!(store.get("anything").await.unwrap(), None);
        store.delete("anything").await.unwrap();
    }
}
