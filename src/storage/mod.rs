//! Remote storage capability
//!
//! A session is opened per upload attempt and closed right after, so a stalled
//! connection never outlives the attempt that opened it.
//!
//! Backends:
//! - `SftpStorage`: an SSH server with the `sftp` subsystem
//! - `S3Storage`: S3-compatible servers (MinIO, R2, AWS)
//! - `LocalStorage`: a directory on the local filesystem

mod local;
mod s3;
mod sftp;

pub use local::LocalStorage;
pub use s3::S3Storage;
pub use sftp::SftpStorage;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{RemoteConfig, RemoteProvider};
use crate::error::StorageError;

/// Connects to the remote file server
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Open a session for a single upload attempt
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, StorageError>;

    /// Human-readable target, for logs
    fn describe(&self) -> String;
}

/// An open connection to the remote file server
#[async_trait]
pub trait RemoteSession: Send {
    /// Write `data` to `remote_path`, replacing any existing file
    async fn upload(&mut self, data: &[u8], remote_path: &str) -> Result<(), StorageError>;

    /// Release the connection
    async fn close(self: Box<Self>) -> Result<(), StorageError>;
}

/// Build the configured backend
pub fn from_config(config: &RemoteConfig) -> Arc<dyn RemoteStorage> {
    match config.provider {
        RemoteProvider::Sftp => Arc::new(SftpStorage::new(config.clone())),
        RemoteProvider::S3 => Arc::new(S3Storage::new(config.clone())),
        // Remote paths already carry the root, so resolve them from "/" or the working dir
        RemoteProvider::Local => {
            let base = if std::path::Path::new(&config.root).is_absolute() {
                "/"
            } else {
                "."
            };
            Arc::new(LocalStorage::new(base))
        }
    }
}
