//! S3-compatible remote storage
//!
//! Wraps the AWS SDK. A client is built per session from static credentials,
//! and the bucket is verified with a HEAD request before any upload.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};

use super::{RemoteSession, RemoteStorage};
use crate::config::RemoteConfig;
use crate::error::StorageError;

/// S3-compatible storage target
#[derive(Clone)]
pub struct S3Storage {
    config: RemoteConfig,
}

impl S3Storage {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }

    fn build_client(&self) -> Client {
        let credentials = Credentials::new(
            &self.config.username,
            &self.config.password,
            None,
            None,
            "file-relay",
        );

        let region = self
            .config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(self.config.endpoint())
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO and other S3-compatible services
            .build();

        Client::from_conf(s3_config)
    }
}

#[async_trait]
impl RemoteStorage for S3Storage {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, StorageError> {
        if self.config.bucket.is_empty() {
            return Err(StorageError::Config("no bucket configured".to_string()));
        }

        let client = self.build_client();
        let bucket = self.config.bucket.clone();

        client
            .head_bucket()
            .bucket(&bucket)
            .send()
            .await
            .map_err(|e| StorageError::Connect(format!("bucket {}: {}", bucket, e)))?;

        tracing::debug!(endpoint = %self.config.endpoint(), bucket = %bucket, "Connected to S3");

        Ok(Box::new(S3Session { client, bucket }))
    }

    fn describe(&self) -> String {
        format!("s3 {}/{}", self.config.endpoint(), self.config.bucket)
    }
}

struct S3Session {
    client: Client,
    bucket: String,
}

/// Object keys have no leading slash
fn object_key(remote_path: &str) -> Result<&str, StorageError> {
    let key = remote_path.trim_start_matches('/');
    if key.is_empty() {
        return Err(StorageError::InvalidPath(remote_path.to_string()));
    }
    Ok(key)
}

#[async_trait]
impl RemoteSession for S3Session {
    async fn upload(&mut self, data: &[u8], remote_path: &str) -> Result<(), StorageError> {
        let key = object_key(remote_path)?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| StorageError::Upload {
                path: remote_path.to_string(),
                reason: e.to_string(),
            })?;

        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), StorageError> {
        // The SDK client holds no session state; dropping it releases the connection pool
        Ok(())
    }
}
