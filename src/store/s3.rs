//! S3 blob store
//!
//! Backs the filesystem with Amazon S3 or an S3-compatible service (MinIO,
//! LocalStack, GCS interoperability endpoints). S3 keeps no separate
//! creation time, so listings report the last-modified time for both.

use async_stream::try_stream;
use async_trait::async_trait;
use aws_config::profile::profile_file::{ProfileFileKind, ProfileFiles};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, trace};

use super::{BlobStore, ObjectInfo, ObjectStream};
use crate::config::BucketConfig;
use crate::error::{FestivusError, Result};
use crate::retry::{retry, RetryPolicy};

/// S3 store for a single bucket
pub struct S3Store {
    client: Client,
    bucket: String,
    retry: RetryPolicy,
}

impl S3Store {
    /// Create a new S3 store from configuration
    pub async fn new(config: &BucketConfig, retry_policy: RetryPolicy) -> Result<Self> {
        let mut sdk_config_builder = aws_config::defaults(BehaviorVersion::latest());

        if let Some(region) = &config.region {
            sdk_config_builder = sdk_config_builder.region(Region::new(region.clone()));
        }

        if let Some(credentials_file) = &config.credentials_file {
            debug!("Using credentials from {:?}", credentials_file);
            let files = ProfileFiles::builder()
                .include_default_config_file(true)
                .with_file(ProfileFileKind::Credentials, credentials_file)
                .build();
            sdk_config_builder = sdk_config_builder.profile_files(files);
        }

        let sdk_config = sdk_config_builder.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());
        info!("Using bucket {}", config.name);

        Ok(Self {
            client,
            bucket: config.name.clone(),
            retry: retry_policy,
        })
    }
}

/// Convert an S3 timestamp to UTC, falling back to the epoch
fn to_utc(dt: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    dt.and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
        .unwrap_or_default()
}

/// Classify an SDK failure; dispatch failures and timeouts are transient
fn map_sdk_error<E, R>(operation: &str, name: &str, err: SdkError<E, R>) -> FestivusError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            FestivusError::BackendUnavailable(format!(
                "S3 {} {}: {}",
                operation,
                name,
                DisplayErrorContext(&err)
            ))
        }
        _ => match err.code() {
            Some("NoSuchKey") | Some("NotFound") => FestivusError::NotFound(name.to_string()),
            Some("AccessDenied") | Some("Forbidden") => {
                FestivusError::PermissionDenied(format!("S3 {} {}", operation, name))
            }
            Some("SlowDown") | Some("ServiceUnavailable") | Some("InternalError") => {
                FestivusError::BackendUnavailable(format!(
                    "S3 {} {}: {}",
                    operation,
                    name,
                    DisplayErrorContext(&err)
                ))
            }
            _ => FestivusError::Backend(format!(
                "S3 {} {}: {}",
                operation,
                name,
                DisplayErrorContext(&err)
            )),
        },
    }
}

#[async_trait]
impl BlobStore for S3Store {
    fn list_objects(&self) -> ObjectStream {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let policy = self.retry.clone();

        Box::pin(try_stream! {
            let mut continuation_token: Option<String> = None;

            loop {
                let token = continuation_token.take();
                let result = retry(&policy, "ListObjectsV2", || {
                    let bucket = bucket.as_str();
                    let mut request = client.list_objects_v2().bucket(bucket);
                    if let Some(token) = &token {
                        request = request.continuation_token(token);
                    }
                    async move {
                        request
                            .send()
                            .await
                            .map_err(|e| map_sdk_error("ListObjectsV2", bucket, e))
                    }
                })
                .await?;

                for obj in result.contents() {
                    if let Some(key) = obj.key() {
                        let updated = to_utc(obj.last_modified());
                        yield ObjectInfo {
                            name: key.to_string(),
                            size: obj.size().unwrap_or(0).max(0) as u64,
                            created: updated,
                            updated,
                        };
                    }
                }

                if result.is_truncated().unwrap_or(false) {
                    continuation_token = result.next_continuation_token().map(|s| s.to_string());
                } else {
                    break;
                }
            }
        })
    }

    async fn get_object(&self, name: &str) -> Result<Bytes> {
        trace!("get_object: bucket={} key={}", self.bucket, name);

        retry(&self.retry, "GetObject", || async move {
            let output = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(name)
                .send()
                .await
                .map_err(|e| map_sdk_error("GetObject", name, e))?;

            let body = output.body.collect().await.map_err(|e| {
                FestivusError::BackendUnavailable(format!("S3 read body error for {}: {}", name, e))
            })?;

            Ok(body.into_bytes())
        })
        .await
    }

    async fn put_object(&self, name: &str, data: Bytes, content_type: &str) -> Result<()> {
        debug!(
            "put_object: bucket={} key={} size={} type={}",
            self.bucket,
            name,
            data.len(),
            content_type
        );

        retry(&self.retry, "PutObject", || {
            let body = ByteStream::from(data.clone());
            async move {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(name)
                    .content_type(content_type)
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("PutObject", name, e))?;
                Ok(())
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_utc() {
        let dt = aws_sdk_s3::primitives::DateTime::from_secs(1_700_000_000);
        assert_eq!(to_utc(Some(&dt)).timestamp(), 1_700_000_000);
        assert_eq!(to_utc(None).timestamp(), 0);
    }
}
