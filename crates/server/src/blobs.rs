//! Filesystem blob store for uploaded artifacts.
//!
//! Keys are stable, URL-safe relative paths of the form
//! `uploads/<session_id>/<millis>-<name>`. The store never overwrites:
//! the millisecond prefix plus the sanitized file name make collisions
//! practically impossible, and a collision is rejected rather than
//! clobbered.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::clock;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("invalid blob key: {0}")]
    InvalidKey(String),

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("blob already exists: {0}")]
    AlreadyExists(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Store a blob and return its key.
    pub async fn put(
        &self,
        session_id: &str,
        file_name: &str,
        data: &[u8],
    ) -> Result<String, BlobError> {
        let name = safe_file_name(file_name);
        if name.is_empty() {
            return Err(BlobError::InvalidKey(file_name.to_string()));
        }

        let key = format!("uploads/{}/{}-{}", session_id, clock::now_epoch_millis(), name);
        let path = self.resolve(&key)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::try_exists(&path).await? {
            return Err(BlobError::AlreadyExists(key));
        }
        tokio::fs::write(&path, data).await?;

        info!(
            component = "blobs",
            event = "blobs.stored",
            session_id = %session_id,
            key = %key,
            size_bytes = data.len(),
            "Stored artifact"
        );

        Ok(key)
    }

    /// Read a blob back by key.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Map a key to an on-disk path, rejecting traversal attempts.
    fn resolve(&self, key: &str) -> Result<PathBuf, BlobError> {
        let relative = key
            .strip_prefix("uploads/")
            .ok_or_else(|| BlobError::InvalidKey(key.to_string()))?;

        let rel_path = Path::new(relative);
        let clean = rel_path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if relative.is_empty() || !clean {
            return Err(BlobError::InvalidKey(key.to_string()));
        }

        Ok(self.root.join(rel_path))
    }
}

/// Keep only characters that are safe in a file name
fn safe_file_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BlobStore::new(dir.path().join("uploads"));
        (dir, store)
    }

    #[tokio::test]
    async fn put_then_get_roundtrip() {
        let (_dir, store) = store();
        let key = store.put("s1", "report.txt", b"contents").await.expect("put");
        assert!(key.starts_with("uploads/s1/"));
        assert!(key.ends_with("-report.txt"));

        let data = store.get(&key).await.expect("get");
        assert_eq!(data, b"contents");
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let (_dir, store) = store();
        for key in [
            "uploads/../secrets",
            "uploads/s1/../../etc/passwd",
            "/etc/passwd",
            "uploads/",
        ] {
            assert!(
                matches!(store.get(key).await, Err(BlobError::InvalidKey(_))),
                "key {} should be invalid",
                key
            );
        }
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let (_dir, store) = store();
        let err = store.get("uploads/s1/0-missing.txt").await.unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)));
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(safe_file_name("a b/c.txt"), "abc.txt");
        assert_eq!(safe_file_name("../../x"), "....x");
        assert_eq!(safe_file_name("ok-name_1.png"), "ok-name_1.png");
    }
}
