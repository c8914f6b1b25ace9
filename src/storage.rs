//! Object storage behind the builder.
//!
//! Keys follow `{prefix}/{cube}/{version}/{tile}/...`; objects are immutable
//! blobs overwritten as a whole. The filesystem store keeps one directory per
//! bucket under its root and is the store used by the local runner and the
//! tests; an S3-backed implementation plugs in behind the same trait.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>, public: bool)
        -> anyhow::Result<()>;
    async fn get(&self, bucket: &str, key: &str) -> anyhow::Result<Vec<u8>>;
    async fn head(&self, bucket: &str, key: &str) -> anyhow::Result<bool>;
    async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<()>;
}

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        _public: bool,
    ) -> anyhow::Result<()> {
        let path = self.path_of(bucket, key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.path_of(bucket, key);
        std::fs::read(&path).map_err(|e| anyhow::anyhow!("read {}: {e}", path.display()))
    }

    async fn head(&self, bucket: &str, key: &str) -> anyhow::Result<bool> {
        Ok(self.path_of(bucket, key).is_file())
    }

    async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<()> {
        let path = self.path_of(bucket, key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Basename of an object key.
pub fn key_basename(key: &str) -> &str {
    Path::new(key)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_head_delete_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        assert!(!store.head("cubes", "a/b.tif").await.unwrap());
        store.put("cubes", "a/b.tif", vec![1, 2, 3], false).await.unwrap();
        assert!(store.head("cubes", "a/b.tif").await.unwrap());
        assert_eq!(store.get("cubes", "a/b.tif").await.unwrap(), vec![1, 2, 3]);

        store.delete("cubes", "a/b.tif").await.unwrap();
        assert!(!store.head("cubes", "a/b.tif").await.unwrap());
        // Deleting a missing object is not an error.
        store.delete("cubes", "a/b.tif").await.unwrap();
    }

    #[tokio::test]
    async fn overwrite_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.put("cubes", "x.tif", vec![1], false).await.unwrap();
        store.put("cubes", "x.tif", vec![2, 2], false).await.unwrap();
        assert_eq!(store.get("cubes", "x.tif").await.unwrap(), vec![2, 2]);
    }

    #[test]
    fn basename_strips_directories() {
        assert_eq!(key_basename("a/b/c_B4.tif"), "c_B4.tif");
        assert_eq!(key_basename("plain.tif"), "plain.tif");
    }
}
