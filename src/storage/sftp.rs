//! SFTP remote storage
//!
//! One SSH connection per session: connect, password auth, open the `sftp`
//! subsystem. Uploads create missing parent directories and overwrite the
//! target file.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::Disconnect;
use russh_keys::key::PublicKey;
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;

use super::{RemoteSession, RemoteStorage};
use crate::config::RemoteConfig;
use crate::error::StorageError;

const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

/// SFTP storage target
#[derive(Clone)]
pub struct SftpStorage {
    config: RemoteConfig,
}

impl SftpStorage {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }
}

/// Host key policy for one connection
struct HostKeyCheck {
    host: String,
    expected: Option<String>,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();

        match self.expected.as_deref() {
            Some(expected) => {
                let matches = host_key_matches(expected, &fingerprint);
                if !matches {
                    tracing::error!(
                        host = %self.host,
                        fingerprint = %fingerprint,
                        "Host key does not match REMOTE_HOST_KEY"
                    );
                }
                Ok(matches)
            }
            None => {
                tracing::debug!(host = %self.host, fingerprint = %fingerprint, "Accepting unpinned host key");
                Ok(true)
            }
        }
    }
}

/// Compare a configured fingerprint (with or without `SHA256:`) to the server's
fn host_key_matches(expected: &str, actual: &str) -> bool {
    expected.trim().trim_start_matches("SHA256:") == actual
}

/// Directories that must exist before `remote_path` can be written, outermost first
fn parent_dirs(remote_path: &str) -> Vec<String> {
    let absolute = remote_path.starts_with('/');
    let parts: Vec<&str> = remote_path.split('/').filter(|p| !p.is_empty()).collect();

    let mut dirs = Vec::new();
    let mut current = String::new();
    for part in parts.iter().take(parts.len().saturating_sub(1)) {
        if absolute || !current.is_empty() {
            current.push('/');
        }
        current.push_str(part);
        dirs.push(current.clone());
    }
    dirs
}

#[async_trait]
impl RemoteStorage for SftpStorage {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, StorageError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(INACTIVITY_TIMEOUT),
            ..Default::default()
        });
        let handler = HostKeyCheck {
            host: self.config.host.clone(),
            expected: self.config.host_key_fingerprint.clone(),
        };

        let mut handle = client::connect(
            config,
            (self.config.host.as_str(), self.config.port),
            handler,
        )
        .await
        .map_err(|e| StorageError::Connect(format!("{}: {}", self.describe(), e)))?;

        let authenticated = handle
            .authenticate_password(&self.config.username, &self.config.password)
            .await
            .map_err(|e| StorageError::Connect(format!("authentication failed: {}", e)))?;
        if !authenticated {
            return Err(StorageError::Connect(format!(
                "authentication rejected for user {}",
                self.config.username
            )));
        }

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| StorageError::Connect(format!("failed to open channel: {}", e)))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| StorageError::Connect(format!("sftp subsystem unavailable: {}", e)))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| StorageError::Connect(format!("sftp handshake failed: {}", e)))?;

        tracing::debug!(host = %self.config.host, port = self.config.port, "Connected to SFTP server");

        Ok(Box::new(SftpRemoteSession { handle, sftp }))
    }

    fn describe(&self) -> String {
        format!(
            "sftp {}@{}:{}",
            self.config.username, self.config.host, self.config.port
        )
    }
}

struct SftpRemoteSession {
    handle: Handle<HostKeyCheck>,
    sftp: SftpSession,
}

impl SftpRemoteSession {
    async fn ensure_parent_dirs(&self, remote_path: &str) -> Result<(), StorageError> {
        for dir in parent_dirs(remote_path) {
            let exists = self
                .sftp
                .try_exists(dir.as_str())
                .await
                .map_err(|e| upload_error(remote_path, format!("stat {}: {}", dir, e)))?;
            if exists {
                continue;
            }

            if let Err(e) = self.sftp.create_dir(dir.as_str()).await {
                // Lost a race with another writer
                let created = self.sftp.try_exists(dir.as_str()).await.unwrap_or(false);
                if !created {
                    return Err(upload_error(remote_path, format!("mkdir {}: {}", dir, e)));
                }
            }
        }
        Ok(())
    }
}

fn upload_error(remote_path: &str, reason: String) -> StorageError {
    StorageError::Upload {
        path: remote_path.to_string(),
        reason,
    }
}

#[async_trait]
impl RemoteSession for SftpRemoteSession {
    async fn upload(&mut self, data: &[u8], remote_path: &str) -> Result<(), StorageError> {
        if remote_path.trim_matches('/').is_empty() {
            return Err(StorageError::InvalidPath(remote_path.to_string()));
        }

        self.ensure_parent_dirs(remote_path).await?;

        let mut file = self
            .sftp
            .create(remote_path)
            .await
            .map_err(|e| upload_error(remote_path, e.to_string()))?;
        file.write_all(data)
            .await
            .map_err(|e| upload_error(remote_path, e.to_string()))?;
        file.shutdown()
            .await
            .map_err(|e| upload_error(remote_path, e.to_string()))?;

        tracing::trace!(remote_path = %remote_path, size = data.len(), "Wrote file over SFTP");
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), StorageError> {
        if let Err(e) = self.sftp.close().await {
            tracing::debug!(error = %e, "Failed to close SFTP subsystem");
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| StorageError::Connect(format!("disconnect failed: {}", e)))
    }
}
