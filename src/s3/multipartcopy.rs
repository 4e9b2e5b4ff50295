use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytesize::{GIB, MIB, TIB};
use derive_more::{AsRef, Display, Into};
use futures::future;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::instrument;
use typed_builder::TypedBuilder;

use super::backend::{BackendError, CompletedObject, ObjectStore, UploadPartCopy};
use super::S3Object;
use crate::types::Metadata;

/// The minimum allowed source size for an S3 object, set to 0 bytes.
///
/// Empty objects are valid and are copied as a single whole-object part.
const MIN_SOURCE_SIZE: i64 = 0;

/// The maximum allowed source size for an S3 object, set to 5 TiB.
const MAX_SOURCE_SIZE: i64 = 5 * TIB as i64;

/// Errors that can occur when creating a `SourceSize`.
#[derive(Debug, Error)]
pub enum SourceSizeError {
    #[error("S3 Object must be at least {MIN_SOURCE_SIZE} bytes. Object size was {0}")]
    TooSmall(i64),
    #[error("S3 Object must be at most {MAX_SOURCE_SIZE} bytes, Object size was {0}")]
    TooLarge(i64),
}

/// Represents a valid source size for an S3 object.
///
/// The size must be at least 0 bytes and at most 5 TiB.
#[derive(Debug, Display, Into, AsRef, Clone, Copy, Eq, PartialEq)]
#[into(owned, ref, ref_mut)]
pub struct SourceSize(i64);

impl TryFrom<i64> for SourceSize {
    type Error = SourceSizeError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value < MIN_SOURCE_SIZE {
            Err(SourceSizeError::TooSmall(value))
        } else if value > MAX_SOURCE_SIZE {
            Err(SourceSizeError::TooLarge(value))
        } else {
            Ok(SourceSize(value))
        }
    }
}

/// The minimum allowed part size for S3 multipart uploads, set to 5 MiB.
///
/// Only the last part of an upload may be smaller than this.
const MIN_PART_SIZE: i64 = 5 * MIB as i64;

/// The maximum allowed part size for S3 multipart uploads, set to 5 GiB.
const MAX_PART_SIZE: i64 = 5 * GIB as i64;

/// The maximum number of parts in a single multipart upload.
const MAX_PART_COUNT: i64 = 10_000;

/// The default number of parts copied concurrently.
///
/// This matches the default connection pool size of a regional S3 endpoint;
/// going beyond it queues requests on the client instead of the network.
pub const DEFAULT_MAX_CONCURRENT_PARTS: NonZeroUsize = match NonZeroUsize::new(10) {
    Some(n) => n,
    None => panic!("default concurrency must be non-zero"),
};

/// Represents a valid part size for S3 multipart uploads.
///
/// The size must be at least 5 MiB and at most 5 GiB.
#[derive(Debug, Display, Into, AsRef, Clone, Copy, Eq, PartialEq)]
#[into(owned, ref, ref_mut)]
pub struct PartSize(i64);

/// The default part size for multipart copies, set to 64 MiB.
///
/// A 1 GiB object is copied in 16 requests, and the largest object S3 allows
/// still fits within the 10,000 part limit only with a larger part size, which
/// callers must choose explicitly.
impl Default for PartSize {
    fn default() -> Self {
        const DEFAULT_COPY_PART_SIZE: i64 = 64 * MIB as i64;
        Self(DEFAULT_COPY_PART_SIZE)
    }
}

#[derive(Debug, Error)]
pub enum PartSizeError {
    #[error("part_size must be at least {MIN_PART_SIZE} bytes. part_size was {0}")]
    TooSmall(i64),
    #[error("part_size must be at most {MAX_PART_SIZE} bytes, part_size was {0}")]
    TooLarge(i64),
}

impl TryFrom<i64> for PartSize {
    type Error = PartSizeError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value < MIN_PART_SIZE {
            Err(PartSizeError::TooSmall(value))
        } else if value > MAX_PART_SIZE {
            Err(PartSizeError::TooLarge(value))
        } else {
            Ok(PartSize(value))
        }
    }
}

impl std::str::FromStr for PartSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PartSize::try_from(s.parse::<i64>()?)?)
    }
}

/// Errors that can occur when creating a `ByteRange`.
#[derive(Debug, Error)]
pub enum ByteRangeError {
    #[error("The start byte must be less than or equal to the end byte \n start: {0}, end: {1}")]
    InvalidRange(i64, i64),
    #[error("The start byte must be non-negative: \n start {0}")]
    NegativeStart(i64),
}

/// An inclusive range of bytes within the source object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange(i64, i64);

impl TryFrom<(i64, i64)> for ByteRange {
    type Error = ByteRangeError;

    fn try_from(value: (i64, i64)) -> Result<Self, Self::Error> {
        let (start, end) = value;

        if start < 0 {
            Err(ByteRangeError::NegativeStart(start))
        } else if start > end {
            Err(ByteRangeError::InvalidRange(start, end))
        } else {
            Ok(ByteRange(start, end))
        }
    }
}

impl ByteRange {
    pub fn start(&self) -> i64 {
        self.0
    }

    pub fn end(&self) -> i64 {
        self.1
    }

    /// Number of bytes covered by the range.
    pub fn len(&self) -> i64 {
        self.1 - self.0 + 1
    }

    /// Generates the `x-amz-copy-source-range` value for the range.
    ///
    /// # Examples
    ///
    /// ```
    /// use cobalt_s3_copy::s3::ByteRange;
    ///
    /// let range = ByteRange::try_from((0, 499)).unwrap();
    /// assert_eq!(range.as_string(), "bytes=0-499");
    /// ```
    pub fn as_string(&self) -> String {
        let ByteRange(start, end) = self;
        format!("bytes={}-{}", start, end)
    }
}

/// What part of the source a single part copies.
///
/// An empty source has no valid byte range, so it is copied whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyRange {
    Whole,
    Bytes(ByteRange),
}

/// One numbered part of the copy. Part numbers start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub part_number: i32,
    pub range: CopyRange,
}

/// Number of parts needed to copy `source_size` bytes, never less than one.
pub fn part_count(source_size: &SourceSize, part_size: &PartSize) -> i64 {
    let source_size = *source_size.as_ref();
    let part_size = *part_size.as_ref();
    ((source_size + part_size - 1) / part_size).max(1)
}

/// Splits the source into contiguous, non-overlapping parts in ascending part order.
pub fn part_ranges(
    source_size: &SourceSize,
    part_size: &PartSize,
) -> Result<Vec<PartRange>, CopyError> {
    let count = part_count(source_size, part_size);
    if count > MAX_PART_COUNT {
        return Err(CopyError::TooManyParts {
            source_size: *source_size,
            part_size: *part_size,
            part_count: count,
        });
    }
    let source_size = *source_size.as_ref();
    let part_size = *part_size.as_ref();

    if source_size == 0 {
        return Ok(vec![PartRange {
            part_number: 1,
            range: CopyRange::Whole,
        }]);
    }

    // count <= MAX_PART_COUNT, so part numbers fit in an i32.
    Ok((1..=count as i32)
        .map(|part_number| {
            let start = (i64::from(part_number) - 1) * part_size;
            let end = std::cmp::min(start + part_size, source_size) - 1;
            // start < source_size, so start <= end always holds here.
            PartRange {
                part_number,
                range: CopyRange::Bytes(ByteRange(start, end)),
            }
        })
        .collect())
}

/// Errors which fail a copy. Any of these leaves no visible target object.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("Source object {object} does not exist")]
    SourceNotFound {
        object: S3Object,
        #[source]
        source: BackendError,
    },
    #[error("Access to source object {object} was denied")]
    SourceAccessDenied {
        object: S3Object,
        #[source]
        source: BackendError,
    },
    #[error("Unable to read source object {object}")]
    SourceUnavailable {
        object: S3Object,
        #[source]
        source: BackendError,
    },
    #[error(transparent)]
    SourceSize(#[from] SourceSizeError),
    #[error("Copying {source_size} bytes in parts of {part_size} bytes needs {part_count} parts, more than S3 allows")]
    TooManyParts {
        source_size: SourceSize,
        part_size: PartSize,
        part_count: i64,
    },
    #[error("Unable to create multipart upload")]
    UploadCreationFailed(#[source] BackendError),
    #[error("Failed to copy part {part_number} ({} part(s) failed)", .failed_parts.len())]
    PartCopyFailed {
        part_number: i32,
        failed_parts: Vec<i32>,
        #[source]
        source: BackendError,
    },
    #[error("Unable to complete multipart upload")]
    CompletionFailed(#[source] BackendError),
    #[error("Multipart copy invariant violated: {0}")]
    InvariantViolation(String),
    #[error("Failed to abort multipart upload {upload_id} after: {cause}")]
    AbortFailed {
        cause: Box<CopyError>,
        upload_id: String,
        #[source]
        source: BackendError,
    },
}

impl CopyError {
    /// The failure which caused the copy to stop, looking through any abort failure.
    pub fn cause(&self) -> &CopyError {
        match self {
            CopyError::AbortFailed { cause, .. } => cause.cause(),
            other => other,
        }
    }

    /// Reduce the failures of several parts to one error reporting the lowest failed part.
    fn from_part_failures(mut failures: Vec<PartCopyError>) -> Option<Self> {
        failures.sort_by_key(|f| f.part_number);
        let failed_parts = failures.iter().map(|f| f.part_number).collect();
        let first = failures.into_iter().next()?;
        Some(CopyError::PartCopyFailed {
            part_number: first.part_number,
            failed_parts,
            source: first.source,
        })
    }
}

/// The failure of a single part copy.
#[derive(Debug, Error)]
#[error("Failed to copy part {part_number}")]
pub struct PartCopyError {
    pub part_number: i32,
    #[source]
    pub source: BackendError,
}

/// Lifecycle of a multipart upload.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Created,
    PartsInFlight,
    Completing,
    Completed,
    Aborted,
}

/// A multipart upload in progress against the target object.
///
/// Only the [MultipartCopier] moves a session between states.
#[derive(Debug, Clone)]
pub struct UploadSession {
    upload_id: String,
    target: S3Object,
    state: UploadState,
}

impl UploadSession {
    pub fn new(upload_id: impl Into<String>, target: S3Object) -> Self {
        Self {
            upload_id: upload_id.into(),
            target,
            state: UploadState::Created,
        }
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn target(&self) -> &S3Object {
        &self.target
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    fn transition(&mut self, next: UploadState) -> Result<(), CopyError> {
        use UploadState::*;
        let allowed = matches!(
            (self.state, next),
            (Created, PartsInFlight)
                | (PartsInFlight, Completing)
                | (Completing, Completed)
                | (Created | PartsInFlight | Completing, Aborted)
        );
        if !allowed {
            return Err(CopyError::InvariantViolation(format!(
                "upload {} can not move from {} to {}",
                self.upload_id, self.state, next
            )));
        }
        tracing::debug!(upload_id = %self.upload_id, from = %self.state, to = %next, "Upload state changed");
        self.state = next;
        Ok(())
    }
}

/// A copied part, identified by the content identifier the backend returned for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartResult {
    pub part_number: i32,
    pub e_tag: String,
}

/// A single object copy. Built once and consumed by [MultipartCopier::copy].
#[derive(Debug, Clone, TypedBuilder)]
pub struct CopyJob {
    source: S3Object,
    target: S3Object,
    source_size: SourceSize,
    #[builder(default)]
    part_size: PartSize,
    /// Metadata of the source object.
    #[builder(default)]
    metadata: Metadata,
    /// Extra metadata recorded on the target, overriding source entries with the same key.
    #[builder(default)]
    metadata_augmentation: Metadata,
}

impl CopyJob {
    pub fn source(&self) -> &S3Object {
        &self.source
    }

    pub fn target(&self) -> &S3Object {
        &self.target
    }

    pub fn source_size(&self) -> SourceSize {
        self.source_size
    }

    pub fn part_size(&self) -> PartSize {
        self.part_size
    }

    /// Metadata the target object is created with.
    pub fn target_metadata(&self) -> Metadata {
        let mut metadata = self.metadata.clone();
        metadata.extend(
            self.metadata_augmentation
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        metadata
    }
}

/// The result of a successful multipart copy.
#[derive(Debug, Clone)]
pub struct CompletedCopy {
    pub object: CompletedObject,
    pub session: UploadSession,
    pub part_count: usize,
}

/// Copies one byte range of `source` into one part of the session's upload.
///
/// No retries are attempted here.
#[instrument(skip(store, session), fields(upload_id = %session.upload_id()))]
pub async fn copy_part(
    store: &dyn ObjectStore,
    source: &S3Object,
    session: &UploadSession,
    part: &PartRange,
) -> Result<PartResult, PartCopyError> {
    tracing::debug!("Copying");
    let request = UploadPartCopy::builder()
        .src(source)
        .dst(session.target())
        .upload_id(session.upload_id())
        .part_number(part.part_number)
        .range(part.range)
        .build();
    let e_tag = store
        .upload_part_copy(request)
        .await
        .map_err(|source| PartCopyError {
            part_number: part.part_number,
            source,
        })?;
    Ok(PartResult {
        part_number: part.part_number,
        e_tag,
    })
}

/// Finalises the upload from exactly one result per part `1..=expected`.
///
/// Parts are sent in ascending part order regardless of the order they finished in.
/// A missing, extra or duplicated part is an [CopyError::InvariantViolation] and the
/// backend is not called.
#[instrument(skip(store, session, parts), fields(upload_id = %session.upload_id()))]
pub async fn complete(
    store: &dyn ObjectStore,
    session: &UploadSession,
    mut parts: Vec<PartResult>,
    expected: usize,
) -> Result<CompletedObject, CopyError> {
    if session.state() != UploadState::Completing {
        return Err(CopyError::InvariantViolation(format!(
            "upload {} completed while {}",
            session.upload_id(),
            session.state()
        )));
    }
    parts.sort_by_key(|part| part.part_number);
    let contiguous =
        parts.len() == expected && parts.iter().zip(1..).all(|(part, n)| part.part_number == n);
    if !contiguous {
        let numbers: Vec<i32> = parts.iter().map(|part| part.part_number).collect();
        return Err(CopyError::InvariantViolation(format!(
            "expected parts 1..={expected}, got {numbers:?}"
        )));
    }

    store
        .complete_multipart_upload(session.target(), session.upload_id(), &parts)
        .await
        .map_err(CopyError::CompletionFailed)
}

/// Copies large objects by splitting them into byte ranges and copying each range
/// concurrently into a part of a multipart upload.
///
/// Every copy creates its own upload; nothing is shared between copies besides the store.
/// On any failure the upload is aborted before returning, so a failed copy never leaves
/// a visible target object or an incomplete upload behind.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use cobalt_s3_copy::config::load_from_env;
/// use cobalt_s3_copy::s3::{
///     client_from_config, CopyJob, MultipartCopier, S3Backend, S3Object, SourceSize,
/// };
///
/// # tokio_test::block_on(async {
/// let shared_config = load_from_env().await.unwrap();
/// let store = Arc::new(S3Backend::new(Arc::new(client_from_config(&shared_config).unwrap())));
///
/// let copier = MultipartCopier::builder().store(store).build();
/// let job = CopyJob::builder()
///     .source(S3Object::new("source-bucket", "source-key"))
///     .target(S3Object::new("target-bucket", "target-key"))
///     .source_size(SourceSize::try_from(130 * 1024 * 1024).unwrap())
///     .build();
/// copier.copy(job).await.unwrap();
/// # })
/// ```
#[derive(Debug, TypedBuilder)]
pub struct MultipartCopier {
    store: Arc<dyn ObjectStore>,
    #[builder(default = DEFAULT_MAX_CONCURRENT_PARTS)]
    max_concurrent_parts: NonZeroUsize,
    /// Delay between dispatching consecutive parts. Parts already in flight keep running.
    #[builder(default)]
    dispatch_interval: Option<Duration>,
}

impl MultipartCopier {
    #[instrument(skip(self, job), fields(source = %job.source, target = %job.target))]
    pub async fn copy(&self, job: CopyJob) -> Result<CompletedCopy, CopyError> {
        let parts = part_ranges(&job.source_size, &job.part_size)?;
        tracing::info!(
            source_size = job.source_size.as_ref(),
            part_size = job.part_size.as_ref(),
            part_count = parts.len(),
            "Starting multipart copy"
        );

        let upload_id = self
            .store
            .create_multipart_upload(&job.target, &job.target_metadata())
            .await
            .map_err(CopyError::UploadCreationFailed)?;
        let mut session = UploadSession::new(upload_id, job.target.clone());
        tracing::info!(upload_id = session.upload_id(), "Multipart upload created");

        match self.copy_and_complete(&job, &mut session, &parts).await {
            Ok(object) => {
                tracing::info!(upload_id = session.upload_id(), "Multipart copy completed");
                Ok(CompletedCopy {
                    object,
                    session,
                    part_count: parts.len(),
                })
            }
            Err(cause) => Err(self.abort(&mut session, cause).await),
        }
    }

    async fn copy_and_complete(
        &self,
        job: &CopyJob,
        session: &mut UploadSession,
        parts: &[PartRange],
    ) -> Result<CompletedObject, CopyError> {
        session.transition(UploadState::PartsInFlight)?;
        let results = self.copy_parts(&job.source, session, parts).await?;

        tracing::info!(upload_id = session.upload_id(), "All parts completed");
        session.transition(UploadState::Completing)?;
        let object = complete(self.store.as_ref(), session, results, parts.len()).await?;
        session.transition(UploadState::Completed)?;
        Ok(object)
    }

    /// Dispatches parts in ascending order through a pool of `max_concurrent_parts`.
    ///
    /// Once a failure is observed no further parts are dispatched; parts already in
    /// flight are allowed to finish but their results are discarded.
    async fn copy_parts(
        &self,
        source: &S3Object,
        session: &UploadSession,
        parts: &[PartRange],
    ) -> Result<Vec<PartResult>, CopyError> {
        let failed = AtomicBool::new(false);
        let failed_ref = &failed;
        let store = self.store.as_ref();
        let interval = self.dispatch_interval;

        let mut in_flight = stream::iter(parts.iter().enumerate())
            .then(move |(i, part)| async move {
                if let Some(interval) = interval.filter(|_| i > 0) {
                    tokio::time::sleep(interval).await;
                }
                part
            })
            .take_while(move |_| future::ready(!failed_ref.load(Ordering::Acquire)))
            .map(move |part| copy_part(store, source, session, part))
            .buffer_unordered(self.max_concurrent_parts.get())
            .boxed();

        let mut results = Vec::with_capacity(parts.len());
        let mut failures = Vec::new();
        while let Some(result) = in_flight.next().await {
            match result {
                Ok(part) => results.push(part),
                Err(failure) => {
                    tracing::error!(
                        part_number = failure.part_number,
                        error = ?failure.source,
                        "Part copy failed"
                    );
                    if !failed.swap(true, Ordering::AcqRel) {
                        tracing::warn!("Not dispatching further parts, waiting for in flight parts");
                    }
                    failures.push(failure);
                }
            }
        }

        match CopyError::from_part_failures(failures) {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    /// Releases the upload after `cause`, returning the error to report.
    async fn abort(&self, session: &mut UploadSession, cause: CopyError) -> CopyError {
        tracing::error!(upload_id = session.upload_id(), error = %cause, "Aborting multipart upload");
        if let Err(e) = session.transition(UploadState::Aborted) {
            tracing::error!(error = %e, "Upload can not be aborted");
            return cause;
        }
        match self
            .store
            .abort_multipart_upload(session.target(), session.upload_id())
            .await
        {
            Ok(()) => cause,
            Err(source) => CopyError::AbortFailed {
                cause: Box::new(cause),
                upload_id: session.upload_id().to_owned(),
                source,
            },
        }
    }
}
