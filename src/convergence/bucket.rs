//! Object store bucket for bootstrap payloads.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::ObjectStoreConfig;
use crate::context::ReconcileContext;
use crate::error::{ErrorClass, Result};
use crate::provider::{ObjectStoreApi, RetryPolicy};

use super::{ConvergenceOutcome, ResourceConvergencePair, ResourceKind};

/// Reconcile/delete pair for the bootstrap bucket.
#[derive(Clone)]
pub struct BucketPair {
    store: Arc<dyn ObjectStoreApi>,
    retry: RetryPolicy,
    config: ObjectStoreConfig,
}

impl BucketPair {
    /// Creates the pair.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStoreApi>, retry: RetryPolicy, config: ObjectStoreConfig) -> Self {
        Self {
            store,
            retry,
            config,
        }
    }

    /// Returns the bucket name.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    /// Returns the full object key for `key` under the configured prefix.
    #[must_use]
    pub fn object_key(&self, key: &str) -> String {
        match self.config.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}/{key}"),
            _ => key.to_string(),
        }
    }

    fn list_prefix(&self) -> String {
        match self.config.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}/"),
            _ => String::new(),
        }
    }

    /// Writes a bootstrap payload and returns its full key.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket is missing or the write fails.
    pub async fn put_object(&self, key: &str, data: &[u8]) -> Result<String> {
        let full_key = self.object_key(key);
        self.retry
            .run("PutObject", || {
                self.store.put_object(&self.config.bucket, &full_key, data)
            })
            .await
            .map_err(|e| e.in_operation("PutObject", &full_key))?;
        debug!(bucket = %self.config.bucket, key = %full_key, bytes = data.len(), "Stored object");
        Ok(full_key)
    }

    /// Deletes a bootstrap payload. Absent objects are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider call fails.
    pub async fn delete_object(&self, key: &str) -> Result<()> {
        let full_key = self.object_key(key);
        match self
            .retry
            .run("DeleteObject", || {
                self.store.delete_object(&self.config.bucket, &full_key)
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.in_operation("DeleteObject", &full_key)),
        }
    }

    /// Returns true if the bucket exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider call fails.
    pub async fn exists(&self) -> Result<bool> {
        self.retry
            .run("HeadBucket", || self.store.bucket_exists(&self.config.bucket))
            .await
    }
}

#[async_trait]
impl ResourceConvergencePair for BucketPair {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Bucket
    }

    fn name(&self) -> &str {
        &self.config.bucket
    }

    async fn reconcile(&self, _ctx: &ReconcileContext) -> Result<ConvergenceOutcome> {
        if self.exists().await? {
            debug!(bucket = %self.config.bucket, "Bucket exists");
            return Ok(ConvergenceOutcome::Unchanged);
        }

        match self
            .retry
            .run("CreateBucket", || self.store.create_bucket(&self.config.bucket))
            .await
        {
            Ok(()) => {
                info!(bucket = %self.config.bucket, "Created bucket");
                Ok(ConvergenceOutcome::Created)
            }
            Err(err) if err.class() == ErrorClass::AlreadyExists => Ok(ConvergenceOutcome::Unchanged),
            Err(err) => Err(err.in_operation("CreateBucket", &self.config.bucket)),
        }
    }

    /// Removes this cluster's payloads, then the bucket. A bucket still
    /// holding other data is reported as a conflict.
    async fn delete(&self, _ctx: &ReconcileContext) -> Result<ConvergenceOutcome> {
        if !self.exists().await? {
            return Ok(ConvergenceOutcome::AlreadyAbsent);
        }

        let prefix = self.list_prefix();
        let keys = self
            .retry
            .run("ListObjectsV2", || self.store.list_objects(&self.config.bucket, &prefix))
            .await?;
        for key in &keys {
            self.retry
                .run("DeleteObject", || self.store.delete_object(&self.config.bucket, key))
                .await
                .map_err(|e| e.in_operation("DeleteObject", key))?;
        }

        match self
            .retry
            .run("DeleteBucket", || self.store.delete_bucket(&self.config.bucket))
            .await
        {
            Ok(()) => {
                info!(bucket = %self.config.bucket, objects = keys.len(), "Deleted bucket");
                Ok(ConvergenceOutcome::Deleted)
            }
            Err(err) if err.is_not_found() => Ok(ConvergenceOutcome::AlreadyAbsent),
            Err(err) => Err(err.in_operation("DeleteBucket", &self.config.bucket)),
        }
    }
}

impl std::fmt::Debug for BucketPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketPair")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
