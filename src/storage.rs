//! Object storage.
//!
//! [`ObjectStore`] is what services code against; [`S3Store`] implements it over any
//! S3 compatible endpoint (AWS, MinIO, R2). Keys are opaque, non-empty strings.

use crate::{
    config::StorageConfig,
    error::{Error, Result},
};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Region},
    error::DisplayErrorContext,
    presigning::PresigningConfig,
    primitives::ByteStream,
    types::MetadataDirective,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::{collections::HashMap, fmt, time::Duration};
use tracing::{Instrument, debug, info_span};

/// Characters kept verbatim in a `x-amz-copy-source` key.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub const DEFAULT_LIST_LIMIT: i32 = 1000;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Object {
    pub key: String,
    pub size: i64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectPage {
    pub objects: Vec<Object>,
    /// Pass back to [`ObjectStore::list`] for the next page; `None` on the last one.
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    async fn upload(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<Object>;

    async fn download(&self, key: &str) -> Result<(Object, Bytes)>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn head(&self, key: &str) -> Result<Object>;

    async fn list(&self, prefix: &str, page_token: Option<&str>, limit: i32) -> Result<ObjectPage>;

    /// A URL the client can `PUT` to until `ttl` elapses.
    async fn presign_upload(&self, key: &str, content_type: &str, ttl: Duration) -> Result<String>;

    async fn presign_download(&self, key: &str, ttl: Duration) -> Result<String>;

    /// Replace the user metadata of an object, keeping its body and content type.
    async fn update_metadata(&self, key: &str, metadata: HashMap<String, String>) -> Result<Object>;
}

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl fmt::Debug for S3Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Store")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl S3Store {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from the default AWS credential chain. A custom endpoint switches
    /// to path-style addressing, which MinIO and most S3 clones expect.
    ///
    /// # Errors
    /// Fails when the bucket name is empty.
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        if config.bucket.trim().is_empty() {
            return Err(Error::configuration("S3_BUCKET must not be empty"));
        }
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        debug!(bucket = %config.bucket, endpoint = ?config.endpoint, "object store configured");

        Ok(Self::new(Client::from_conf(builder.build()), &config.bucket))
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn check_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        Err(Error::validation("object key must not be empty"))
    } else {
        Ok(())
    }
}

fn transient<E>(action: &str, key: &str, err: E) -> Error
where
    E: std::error::Error,
{
    Error::transient(format!("s3 {action} {key}: {}", DisplayErrorContext(err)))
}

fn convert_time(time: Option<&aws_sdk_s3::primitives::DateTime>) -> Option<DateTime<Utc>> {
    time.and_then(|time| DateTime::from_timestamp(time.secs(), time.subsec_nanos()))
}

fn presigning(ttl: Duration) -> Result<PresigningConfig> {
    PresigningConfig::expires_in(ttl)
        .map_err(|err| Error::validation(format!("invalid presign ttl {ttl:?}: {err}")))
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn upload(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<Object> {
        check_key(key)?;
        let size = i64::try_from(body.len()).unwrap_or(i64::MAX);
        let span = info_span!("s3.put_object", s3.bucket = %self.bucket, s3.key = %key);
        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .set_metadata(Some(metadata.clone()))
            .body(ByteStream::from(body))
            .send()
            .instrument(span)
            .await
            .map_err(|err| transient("upload", key, err))?;

        Ok(Object {
            key: key.to_string(),
            size,
            content_type: Some(content_type.to_string()),
            etag: output.e_tag().map(str::to_string),
            last_modified: Some(Utc::now()),
            metadata,
        })
    }

    async fn download(&self, key: &str) -> Result<(Object, Bytes)> {
        check_key(key)?;
        let span = info_span!("s3.get_object", s3.bucket = %self.bucket, s3.key = %key);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .instrument(span)
            .await
            .map_err(|err| {
                let err = err.into_service_error();
                if err.is_no_such_key() {
                    Error::not_found(format!("object {key}"))
                } else {
                    transient("download", key, err)
                }
            })?;

        let object = Object {
            key: key.to_string(),
            size: output.content_length().unwrap_or_default(),
            content_type: output.content_type().map(str::to_string),
            etag: output.e_tag().map(str::to_string),
            last_modified: convert_time(output.last_modified()),
            metadata: output.metadata().cloned().unwrap_or_default(),
        };
        let body = output
            .body
            .collect()
            .await
            .map_err(|err| transient("download", key, err))?
            .into_bytes();
        Ok((object, body))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        check_key(key)?;
        let span = info_span!("s3.delete_object", s3.bucket = %self.bucket, s3.key = %key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .instrument(span)
            .await
            .map_err(|err| transient("delete", key, err))?;
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Object> {
        check_key(key)?;
        let span = info_span!("s3.head_object", s3.bucket = %self.bucket, s3.key = %key);
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .instrument(span)
            .await
            .map_err(|err| {
                let err = err.into_service_error();
                if err.is_not_found() {
                    Error::not_found(format!("object {key}"))
                } else {
                    transient("head", key, err)
                }
            })?;

        Ok(Object {
            key: key.to_string(),
            size: output.content_length().unwrap_or_default(),
            content_type: output.content_type().map(str::to_string),
            etag: output.e_tag().map(str::to_string),
            last_modified: convert_time(output.last_modified()),
            metadata: output.metadata().cloned().unwrap_or_default(),
        })
    }

    async fn list(&self, prefix: &str, page_token: Option<&str>, limit: i32) -> Result<ObjectPage> {
        let limit = if limit <= 0 { DEFAULT_LIST_LIMIT } else { limit };
        let span = info_span!("s3.list_objects", s3.bucket = %self.bucket, s3.prefix = %prefix);
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(limit)
            .set_continuation_token(page_token.map(str::to_string))
            .send()
            .instrument(span)
            .await
            .map_err(|err| transient("list", prefix, err))?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|item| {
                Some(Object {
                    key: item.key()?.to_string(),
                    size: item.size().unwrap_or_default(),
                    content_type: None,
                    etag: item.e_tag().map(str::to_string),
                    last_modified: convert_time(item.last_modified()),
                    metadata: HashMap::new(),
                })
            })
            .collect();

        Ok(ObjectPage {
            objects,
            next_page_token: output
                .next_continuation_token()
                .filter(|_| output.is_truncated().unwrap_or(false))
                .map(str::to_string),
        })
    }

    async fn presign_upload(&self, key: &str, content_type: &str, ttl: Duration) -> Result<String> {
        check_key(key)?;
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .presigned(presigning(ttl)?)
            .await
            .map_err(|err| transient("presign upload", key, err))?;
        Ok(request.uri().to_string())
    }

    async fn presign_download(&self, key: &str, ttl: Duration) -> Result<String> {
        check_key(key)?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning(ttl)?)
            .await
            .map_err(|err| transient("presign download", key, err))?;
        Ok(request.uri().to_string())
    }

    async fn update_metadata(&self, key: &str, metadata: HashMap<String, String>) -> Result<Object> {
        // The copy drops the content type unless it is sent again.
        let current = self.head(key).await?;
        let source = format!(
            "{}/{}",
            self.bucket,
            utf8_percent_encode(key, COPY_SOURCE)
        );
        let span = info_span!("s3.copy_object", s3.bucket = %self.bucket, s3.key = %key);
        let output = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .key(key)
            .copy_source(source)
            .metadata_directive(MetadataDirective::Replace)
            .set_content_type(current.content_type.clone())
            .set_metadata(Some(metadata.clone()))
            .send()
            .instrument(span)
            .await
            .map_err(|err| transient("update metadata", key, err))?;

        Ok(Object {
            etag: output
                .copy_object_result()
                .and_then(|result| result.e_tag())
                .map(str::to_string)
                .or(current.etag),
            last_modified: output
                .copy_object_result()
                .and_then(|result| convert_time(result.last_modified()))
                .or(current.last_modified),
            metadata,
            ..current
        })
    }
}
