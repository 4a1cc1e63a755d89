//! Object storage: asset listings, public uploads and presigned exports.

use crate::config::StorageConfig;
use crate::error::StorageError;
use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use std::time::Duration;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Every key under `prefix`, in listing order.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Upload a world-readable object and return its public URL.
    async fn put_public(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError>;

    /// Upload a private object and return a time-limited download URL.
    async fn put_private_presigned(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        expires_in: Duration,
    ) -> Result<String, StorageError>;

    /// Public URL of `key`, without any cache-busting suffix.
    fn public_url(&self, key: &str) -> String;
}

/// S3-backed store.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    public_base_url: String,
}

impl S3Store {
    pub async fn connect(config: &StorageConfig) -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        Self {
            client: aws_sdk_s3::Client::new(&sdk_config),
            bucket: config.bucket.clone(),
            public_base_url: config.public_base_url.clone(),
        }
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        acl: Option<ObjectCannedAcl>,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .set_acl(acl)
            .send()
            .await
            .map_err(|error| StorageError::Upload {
                key: key.to_string(),
                reason: DisplayErrorContext(&error).to_string(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|error| StorageError::List {
                prefix: prefix.to_string(),
                reason: DisplayErrorContext(&error).to_string(),
            })?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key().map(ToString::to_string)),
            );
        }

        tracing::debug!(prefix, count = keys.len(), "listed objects");
        Ok(keys)
    }

    async fn put_public(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.put(key, body, content_type, Some(ObjectCannedAcl::PublicRead))
            .await?;
        tracing::info!(key, "uploaded public object");
        Ok(self.public_url(key))
    }

    async fn put_private_presigned(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        self.put(key, body, content_type, None).await?;

        let presign_error = |reason: String| StorageError::Presign {
            key: key.to_string(),
            reason,
        };
        let presigning =
            PresigningConfig::expires_in(expires_in).map_err(|e| presign_error(e.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| presign_error(DisplayErrorContext(&e).to_string()))?;

        tracing::info!(key, expires_in_secs = expires_in.as_secs(), "uploaded private object");
        Ok(request.uri().to_string())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{key}", self.public_base_url.trim_end_matches('/'))
    }
}
