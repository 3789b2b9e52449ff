//! Local filesystem storage
//!
//! Remote paths are resolved under a base directory. Files are written to a
//! temporary sibling and renamed into place, so a reader never sees a
//! partially written file.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{RemoteSession, RemoteStorage};
use crate::error::StorageError;

#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Map a remote path onto the base directory, refusing `..` escapes
    fn resolve(&self, remote_path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(remote_path.trim_start_matches('/'));

        let mut resolved = self.base_path.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(StorageError::InvalidPath(remote_path.to_string())),
            }
        }

        if resolved == self.base_path {
            return Err(StorageError::InvalidPath(remote_path.to_string()));
        }
        Ok(resolved)
    }
}

#[async_trait]
impl RemoteStorage for LocalStorage {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, StorageError> {
        tokio::fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| StorageError::Connect(format!("{}: {}", self.base_path.display(), e)))?;

        Ok(Box::new(LocalSession {
            storage: self.clone(),
        }))
    }

    fn describe(&self) -> String {
        format!("local {}", self.base_path.display())
    }
}

struct LocalSession {
    storage: LocalStorage,
}

#[async_trait]
impl RemoteSession for LocalSession {
    async fn upload(&mut self, data: &[u8], remote_path: &str) -> Result<(), StorageError> {
        let path = self.storage.resolve(remote_path)?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidPath(remote_path.to_string()))?;
        tokio::fs::create_dir_all(parent).await?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidPath(remote_path.to_string()))?;
        let temp_path = parent.join(format!(".{}.{}.part", file_name, Uuid::new_v4()));

        let write = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp_path, &path).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(StorageError::Upload {
                path: remote_path.to_string(),
                reason: e.to_string(),
            });
        }

        tracing::trace!(path = %path.display(), size = data.len(), "Wrote file");
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}
