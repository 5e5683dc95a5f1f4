//! S3 object store backend.
//!
//! Serves the bucket capability from AWS S3 (or a compatible service).
//! Credentials come from the standard AWS environment chain.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use tracing::{debug, info};

use crate::error::{ConvergeError, ProviderError, Result};

use super::api::ObjectStoreApi;

/// Region in which buckets are created without a location constraint.
const DEFAULT_REGION: &str = "us-east-1";

/// S3-backed object store.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    /// S3 client.
    client: Client,
    /// Region new buckets are created in.
    region: Option<String>,
}

/// Maps an S3 service error onto the provider error taxonomy.
fn classify<E>(operation: &str, resource: &str, err: &E) -> ConvergeError
where
    E: ProvideErrorMetadata + std::fmt::Display,
{
    let message = format!("{operation} {resource}: {err}");
    let provider = match err.code() {
        Some("NoSuchBucket" | "NoSuchKey" | "NotFound") => {
            ProviderError::not_found("bucket", resource)
        }
        Some("BucketAlreadyOwnedByYou" | "BucketAlreadyExists") => {
            ProviderError::already_exists("bucket", resource)
        }
        Some("BucketNotEmpty" | "OperationAborted") => ProviderError::Conflict { message },
        Some("SlowDown" | "ServiceUnavailable" | "InternalError" | "RequestTimeout") | None => {
            ProviderError::Transient { message }
        }
        Some("AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch") => {
            ProviderError::Unauthorized { message }
        }
        Some(_) => ProviderError::Validation { message },
    };
    provider.into()
}

impl S3ObjectStore {
    /// Creates a store using the AWS environment, optionally pinned to a region.
    pub async fn new(region: Option<&str>) -> Self {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self {
            client: Client::new(&config),
            region: region.map(str::to_string),
        }
    }

    /// Creates a store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, region: Option<&str>) -> Self {
        Self {
            client,
            region: region.map(str::to_string),
        }
    }

    fn location_constraint(&self) -> Option<CreateBucketConfiguration> {
        self.region
            .as_deref()
            .filter(|r| *r != DEFAULT_REGION)
            .map(|r| {
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(r))
                    .build()
            })
    }
}

#[async_trait]
impl ObjectStoreApi for S3ObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(classify("HeadBucket", bucket, &service_err))
                }
            }
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        info!("Creating bucket s3://{bucket}");
        self.client
            .create_bucket()
            .bucket(bucket)
            .set_create_bucket_configuration(self.location_constraint())
            .send()
            .await
            .map_err(|e| classify("CreateBucket", bucket, &e.into_service_error()))?;
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        info!("Deleting bucket s3://{bucket}");
        self.client
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| classify("DeleteBucket", bucket, &e.into_service_error()))?;
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| classify("ListObjectsV2", bucket, &e.into_service_error()))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|o| o.key().map(str::to_string)),
            );

            match response.next_continuation_token() {
                Some(next) if response.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string());
                }
                _ => break,
            }
        }

        debug!("Listed {} objects in s3://{bucket}/{prefix}", keys.len());
        Ok(keys)
    }

    async fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        debug!("Writing s3://{bucket}/{key}");
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| classify("PutObject", bucket, &e.into_service_error()))?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        debug!("Deleting s3://{bucket}/{key}");
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("DeleteObject", bucket, &e.into_service_error()))?;
        Ok(())
    }
}
