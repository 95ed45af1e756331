//! Key-value persistence for transfer state
//!
//! Transfer stores write through a [`KvStore`] under a fixed key layout:
//!
//! ```text
//! sent/transfers                 list of outgoing transfer IDs
//! sent/<tid>/info                immutable transfer record (parts included)
//! sent/<tid>/state               part statuses, used cyphers, status
//! received/transfers             list of incoming transfer IDs
//! received/<tid>/info            TransferInfo as announced by the sender
//! received/<tid>/state           received bitmap, used cyphers
//! received/<tid>/part/<n>        raw part data
//! ```

use crate::BoxFuture;
use crate::config::StorageConfig;
use crate::error::{Result, TransferError};
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

/// Persistent byte-valued key-value store
pub trait KvStore: Send + Sync {
    /// Value under `key`, or `None` if absent
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;

    /// Store `value` under `key`, replacing any previous value
    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<()>>;

    /// Remove `key`; removing an absent key is not an error
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Load and deserialize a JSON record
pub(crate) async fn load_json<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Result<Option<T>> {
    match kv.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Serialize and store a JSON record
pub(crate) async fn save_json<T: Serialize>(kv: &dyn KvStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    kv.set(key, bytes).await
}

/// Filesystem store: one file per key below a root directory
#[derive(Debug, Clone)]
pub struct FsKvStore {
    root: PathBuf,
}

impl FsKvStore {
    /// Open a store rooted at `root`, creating the directory if needed
    ///
    /// # Errors
    ///
    /// Returns `TransferError::Storage` if the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Open the store configured by `config`
    ///
    /// # Errors
    ///
    /// Returns `TransferError::Storage` if the directory cannot be created.
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        Self::open(config.state_dir.clone()).await
    }

    /// Root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(TransferError::Storage(format!("invalid key {key:?}")));
        }
        Ok(self.root.join(relative))
    }

    async fn write_atomic(&self, path: &Path, value: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        fs::write(&tmp, value).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

impl KvStore for FsKvStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            match fs::read(&path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            self.write_atomic(&path, &value).await
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            }

            // Prune now-empty directories up to the root
            let mut dir = path.parent();
            while let Some(current) = dir {
                if current == self.root || fs::remove_dir(current).await.is_err() {
                    break;
                }
                dir = current.parent();
            }
            Ok(())
        })
    }
}

/// In-memory store, for tests and ephemeral managers
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryKvStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys held
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All keys, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

impl KvStore for MemoryKvStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move { Ok(self.entries.get(key).map(|v| v.value().clone())) })
    }

    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.entries.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.entries.remove(key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_store_set_get_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsKvStore::open(temp_dir.path().join("state")).await.unwrap();

        store.set("sent/abcd/info", b"record".to_vec()).await.unwrap();
        assert_eq!(
            store.get("sent/abcd/info").await.unwrap(),
            Some(b"record".to_vec())
        );

        store.delete("sent/abcd/info").await.unwrap();
        assert_eq!(store.get("sent/abcd/info").await.unwrap(), None);
        assert!(!temp_dir.path().join("state/sent").exists());
        assert!(temp_dir.path().join("state").exists());

        // Deleting again is fine
        store.delete("sent/abcd/info").await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_store_from_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            state_dir: temp_dir.path().join("configured"),
        };

        let store = FsKvStore::from_config(&config).await.unwrap();
        assert_eq!(store.root(), config.state_dir.as_path());
        assert!(config.state_dir.is_dir());
    }

    #[tokio::test]
    async fn test_fs_store_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsKvStore::open(temp_dir.path()).await.unwrap();

        store.set("k", vec![1]).await.unwrap();
        store.set("k", vec![2, 3]).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(vec![2, 3]));
    }

    #[tokio::test]
    async fn test_fs_store_rejects_escaping_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsKvStore::open(temp_dir.path()).await.unwrap();

        assert!(store.set("../outside", vec![1]).await.is_err());
        assert!(store.set("/absolute", vec![1]).await.is_err());
        assert!(store.get("").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryKvStore::new();
        store.set("b", vec![2]).await.unwrap();
        store.set("a", vec![1]).await.unwrap();
        assert_eq!(store.keys(), vec!["a".to_string(), "b".to_string()]);

        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let store = MemoryKvStore::new();
        save_json(&store, "list", &vec!["x".to_string()]).await.unwrap();

        let loaded: Option<Vec<String>> = load_json(&store, "list").await.unwrap();
        assert_eq!(loaded, Some(vec!["x".to_string()]));

        let missing: Option<Vec<String>> = load_json(&store, "nothing").await.unwrap();
        assert!(missing.is_none());
    }
}
