//! The object storage operations consumed by the copier, and their S3 implementation.

use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Tag as S3Tag, Tagging};
use aws_sdk_s3::Client;
use derive_more::Display;
use thiserror::Error;
use tracing::instrument;
use typed_builder::TypedBuilder;

use super::metadata::{Tag, TagSet};
use super::multipartcopy::{CopyRange, PartResult};
use super::S3Object;
use crate::types::{Metadata, SdkError};

/// Broad classes of backend failure, used to decide how a failure propagates.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    #[display("not found")]
    NotFound,
    #[display("access denied")]
    AccessDenied,
    #[display("transient backend error")]
    Transient,
    #[display("backend error")]
    Other,
}

/// A failed call against the object store.
#[derive(Debug, Error)]
#[error("{operation} failed: {kind}")]
pub struct BackendError {
    kind: BackendErrorKind,
    operation: &'static str,
    #[source]
    source: Box<dyn StdError + Send + Sync>,
}

impl BackendError {
    pub fn new(
        kind: BackendErrorKind,
        operation: &'static str,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            kind,
            operation,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> BackendErrorKind {
        self.kind
    }

    /// The backend operation which failed, e.g. `UploadPartCopy`.
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Whether the same request may succeed if sent again.
    pub fn is_retryable(&self) -> bool {
        self.kind == BackendErrorKind::Transient
    }

    /// A response was received but a field we rely on was absent.
    fn missing(operation: &'static str, field: &'static str) -> Self {
        Self::new(
            BackendErrorKind::Other,
            operation,
            format!("response did not contain {field}"),
        )
    }

    fn from_sdk<E>(operation: &'static str, err: SdkError<E>) -> Self
    where
        E: ProvideErrorMetadata + StdError + Send + Sync + 'static,
    {
        let kind = match &err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
                BackendErrorKind::Transient
            }
            SdkError::ServiceError(_) => {
                classify(err.raw_response().map(|r| r.status().as_u16()), err.code())
            }
            _ => BackendErrorKind::Other,
        };
        Self::new(kind, operation, err)
    }
}

/// Classify a service error by its http status and S3 error code.
///
/// `HeadObject` responses have no body, so the status code is the only signal there.
pub(crate) fn classify(status: Option<u16>, code: Option<&str>) -> BackendErrorKind {
    match code {
        Some("NoSuchKey" | "NoSuchBucket" | "NotFound" | "NoSuchUpload") => {
            return BackendErrorKind::NotFound
        }
        Some("AccessDenied" | "Forbidden") => return BackendErrorKind::AccessDenied,
        Some(
            "SlowDown" | "Throttling" | "ThrottlingException" | "RequestTimeout"
            | "InternalError" | "ServiceUnavailable",
        ) => return BackendErrorKind::Transient,
        _ => {}
    }
    match status {
        Some(404) => BackendErrorKind::NotFound,
        Some(403) => BackendErrorKind::AccessDenied,
        Some(408 | 429) => BackendErrorKind::Transient,
        Some(status) if (500..600).contains(&status) => BackendErrorKind::Transient,
        _ => BackendErrorKind::Other,
    }
}

/// Size and user metadata of an existing object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: i64,
    pub metadata: Metadata,
}

/// A reference to an object made visible by completing a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedObject {
    pub object: S3Object,
    pub e_tag: Option<String>,
    pub version_id: Option<String>,
}

/// The parameters required for copying a range of the source into one part of an upload.
#[derive(Debug, Clone, TypedBuilder)]
pub struct UploadPartCopy<'a> {
    pub src: &'a S3Object,
    pub dst: &'a S3Object,
    pub upload_id: &'a str,
    pub part_number: i32,
    pub range: CopyRange,
}

/// The object storage primitives needed to copy an object with a multipart upload.
///
/// Implementations must be safe to call concurrently; parts are copied in parallel
/// against a single shared store.
#[async_trait]
pub trait ObjectStore: std::fmt::Debug + Send + Sync {
    async fn head_object(&self, object: &S3Object) -> Result<ObjectInfo, BackendError>;

    async fn get_object_tags(&self, object: &S3Object) -> Result<TagSet, BackendError>;

    /// Returns the upload id of the new multipart upload.
    async fn create_multipart_upload(
        &self,
        target: &S3Object,
        metadata: &Metadata,
    ) -> Result<String, BackendError>;

    /// Returns the content identifier (ETag) of the copied part.
    async fn upload_part_copy(&self, part: UploadPartCopy<'_>) -> Result<String, BackendError>;

    /// `parts` are sent in the order given.
    async fn complete_multipart_upload(
        &self,
        target: &S3Object,
        upload_id: &str,
        parts: &[PartResult],
    ) -> Result<CompletedObject, BackendError>;

    async fn abort_multipart_upload(
        &self,
        target: &S3Object,
        upload_id: &str,
    ) -> Result<(), BackendError>;

    async fn put_object_tags(&self, object: &S3Object, tags: &TagSet) -> Result<(), BackendError>;
}

/// An [ObjectStore] backed by the AWS S3 API.
///
/// Range copies are issued against the destination bucket, so when copying
/// across regions the store used for the upload should be built from a client
/// configured for the target region.
#[derive(Debug, Clone)]
pub struct S3Backend {
    client: Arc<Client>,
}

impl S3Backend {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self))]
    async fn head_object(&self, object: &S3Object) -> Result<ObjectInfo, BackendError> {
        const OP: &str = "HeadObject";
        let output = self
            .client
            .head_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await
            .map_err(|e| BackendError::from_sdk(OP, e))?;

        let size = output
            .content_length()
            .ok_or_else(|| BackendError::missing(OP, "ContentLength"))?;
        Ok(ObjectInfo {
            size,
            metadata: output.metadata().cloned().unwrap_or_default(),
        })
    }

    #[instrument(skip(self))]
    async fn get_object_tags(&self, object: &S3Object) -> Result<TagSet, BackendError> {
        let output = self
            .client
            .get_object_tagging()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await
            .map_err(|e| BackendError::from_sdk("GetObjectTagging", e))?;

        Ok(output
            .tag_set()
            .iter()
            .map(|tag| Tag::new(tag.key(), tag.value()))
            .collect())
    }

    #[instrument(skip(self))]
    async fn create_multipart_upload(
        &self,
        target: &S3Object,
        metadata: &Metadata,
    ) -> Result<String, BackendError> {
        const OP: &str = "CreateMultipartUpload";
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key)
            .set_metadata(Some(metadata.clone()))
            .send()
            .await
            .map_err(|e| BackendError::from_sdk(OP, e))?;

        output
            .upload_id()
            .map(str::to_owned)
            .ok_or_else(|| BackendError::missing(OP, "UploadId"))
    }

    #[instrument(skip(self))]
    async fn upload_part_copy(&self, part: UploadPartCopy<'_>) -> Result<String, BackendError> {
        const OP: &str = "UploadPartCopy";
        let copy_source_range = match part.range {
            CopyRange::Whole => None,
            CopyRange::Bytes(range) => Some(range.as_string()),
        };
        let output = self
            .client
            .upload_part_copy()
            .bucket(&part.dst.bucket)
            .key(&part.dst.key)
            .upload_id(part.upload_id)
            .part_number(part.part_number)
            .copy_source(part.src.copy_source())
            .set_copy_source_range(copy_source_range)
            .send()
            .await
            .map_err(|e| BackendError::from_sdk(OP, e))?;

        output
            .copy_part_result()
            .ok_or_else(|| BackendError::missing(OP, "CopyPartResult"))?
            .e_tag()
            .map(str::to_owned)
            .ok_or_else(|| BackendError::missing(OP, "ETag"))
    }

    #[instrument(skip(self, parts), fields(parts = parts.len()))]
    async fn complete_multipart_upload(
        &self,
        target: &S3Object,
        upload_id: &str,
        parts: &[PartResult],
    ) -> Result<CompletedObject, BackendError> {
        let completed_parts = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .e_tag(&part.e_tag)
                    .part_number(part.part_number)
                    .build()
            })
            .collect();
        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| BackendError::from_sdk("CompleteMultipartUpload", e))?;

        Ok(CompletedObject {
            object: target.clone(),
            e_tag: output.e_tag().map(str::to_owned),
            version_id: output.version_id().map(str::to_owned),
        })
    }

    #[instrument(skip(self))]
    async fn abort_multipart_upload(
        &self,
        target: &S3Object,
        upload_id: &str,
    ) -> Result<(), BackendError> {
        self.client
            .abort_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| BackendError::from_sdk("AbortMultipartUpload", e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn put_object_tags(&self, object: &S3Object, tags: &TagSet) -> Result<(), BackendError> {
        const OP: &str = "PutObjectTagging";
        let tag_set = tags
            .iter()
            .map(|tag| S3Tag::builder().key(&tag.key).value(&tag.value).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BackendError::new(BackendErrorKind::Other, OP, e))?;
        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .map_err(|e| BackendError::new(BackendErrorKind::Other, OP, e))?;

        self.client
            .put_object_tagging()
            .bucket(&object.bucket)
            .key(&object.key)
            .tagging(tagging)
            .send()
            .await
            .map_err(|e| BackendError::from_sdk(OP, e))?;
        Ok(())
    }
}
