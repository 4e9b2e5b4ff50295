use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;
use typed_builder::TypedBuilder;

use super::backend::ObjectStore;
use super::metadata::{
    MetadataReader, TagPropagationError, TagPropagator, TargetVerifier, VerificationError,
};
use super::multipartcopy::{
    CompletedCopy, CopyError, CopyJob, MultipartCopier, PartSize, DEFAULT_MAX_CONCURRENT_PARTS,
};
use super::S3Object;
use crate::types::Metadata;

/// How a replication finished.
#[derive(Debug)]
pub enum CopyOutcome {
    /// The object, its metadata and its tags were all copied.
    Completed(CompletedCopy),
    /// The object and its metadata were copied, but its tags could not be applied.
    /// The copy is kept.
    CompletedWithoutTags {
        copy: CompletedCopy,
        error: TagPropagationError,
    },
    /// The copy and its tags were written, but reading the target back showed
    /// different metadata or tags, or the target could not be read.
    Unverified {
        copy: CompletedCopy,
        error: VerificationError,
    },
}

impl CopyOutcome {
    pub fn copy(&self) -> &CompletedCopy {
        match self {
            CopyOutcome::Completed(copy) => copy,
            CopyOutcome::CompletedWithoutTags { copy, .. } => copy,
            CopyOutcome::Unverified { copy, .. } => copy,
        }
    }

    pub fn has_warning(&self) -> bool {
        !matches!(self, CopyOutcome::Completed(_))
    }
}

/// Replicates an object with its user metadata and tags.
///
/// Source metadata and tags are read through `source_store`. The copy itself and
/// the tags are written through `target_store`, which for S3 must be a client of
/// the target bucket's region.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use cobalt_s3_copy::config::load_from_env;
/// use cobalt_s3_copy::s3::{client_from_config, S3Backend, S3Object, S3Replicator};
///
/// # tokio_test::block_on(async {
/// let shared_config = load_from_env().await.unwrap();
/// let store = Arc::new(S3Backend::new(Arc::new(client_from_config(&shared_config).unwrap())));
///
/// let replicator = S3Replicator::builder()
///     .source_store(store.clone())
///     .target_store(store)
///     .build();
/// let outcome = replicator
///     .replicate(
///         &"s3://source-bucket/bigfile".parse().unwrap(),
///         &"s3://target-bucket/bigfile".parse().unwrap(),
///     )
///     .await
///     .unwrap();
/// println!("{:?}", outcome.copy().object);
/// # })
/// ```
#[derive(Debug, TypedBuilder)]
pub struct S3Replicator {
    source_store: Arc<dyn ObjectStore>,
    target_store: Arc<dyn ObjectStore>,
    #[builder(default)]
    part_size: PartSize,
    #[builder(default = DEFAULT_MAX_CONCURRENT_PARTS)]
    max_concurrent_parts: NonZeroUsize,
    #[builder(default)]
    dispatch_interval: Option<Duration>,
    /// Added to the metadata of every target object.
    #[builder(default)]
    metadata_augmentation: Metadata,
    /// Read the target back after tagging it, reporting differences as a warning.
    #[builder(default)]
    verify_target: bool,
}

impl S3Replicator {
    #[instrument(skip(self), fields(source = %source, target = %target))]
    pub async fn replicate(
        &self,
        source: &S3Object,
        target: &S3Object,
    ) -> Result<CopyOutcome, CopyError> {
        let source_object = MetadataReader::new(self.source_store.clone())
            .read(source)
            .await?;

        let job = CopyJob::builder()
            .source(source.clone())
            .target(target.clone())
            .source_size(source_object.size)
            .part_size(self.part_size)
            .metadata(source_object.metadata)
            .metadata_augmentation(self.metadata_augmentation.clone())
            .build();
        let target_metadata = job.target_metadata();
        let copy = MultipartCopier::builder()
            .store(self.target_store.clone())
            .max_concurrent_parts(self.max_concurrent_parts)
            .dispatch_interval(self.dispatch_interval)
            .build()
            .copy(job)
            .await?;

        if let Err(error) = TagPropagator::new(self.target_store.clone())
            .propagate(target, &source_object.tags)
            .await
        {
            tracing::warn!(error = ?error, "Object copied without tags");
            return Ok(CopyOutcome::CompletedWithoutTags { copy, error });
        }

        if !self.verify_target {
            return Ok(CopyOutcome::Completed(copy));
        }
        match TargetVerifier::new(self.target_store.clone())
            .verify(target, &target_metadata, &source_object.tags)
            .await
        {
            Ok(()) => Ok(CopyOutcome::Completed(copy)),
            Err(error) => {
                tracing::warn!(error = ?error, "Copied object failed verification");
                Ok(CopyOutcome::Unverified { copy, error })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::backend::BackendErrorKind;
    use crate::s3::fake_store::FakeStore;
    use crate::s3::metadata::{Tag, TagSet};
    use assert_matches::assert_matches;

    const MIB: i64 = bytesize::MIB as i64;

    fn src() -> S3Object {
        S3Object::new("sun-ada-bucket-tokyo", "bigfile_100mb")
    }

    fn dst() -> S3Object {
        S3Object::new("sun-ada-bucket-osaka", "bigfile_100mb")
    }

    fn tags() -> TagSet {
        vec![Tag::new("project", "osaka"), Tag::new("owner", "data-eng")].into()
    }

    fn store_with_source(size: i64) -> Arc<FakeStore> {
        let store = Arc::new(FakeStore::default());
        store.insert_object(
            &src(),
            size,
            Metadata::from([("origin".to_string(), "tokyo".to_string())]),
            tags(),
        );
        store
    }

    fn replicator(store: &Arc<FakeStore>) -> S3Replicator {
        S3Replicator::builder()
            .source_store(store.clone())
            .target_store(store.clone())
            .metadata_augmentation(Metadata::from([("add".to_string(), "metadata".to_string())]))
            .build()
    }

    #[tokio::test]
    async fn test_replicate_object_metadata_and_tags() {
        let store = store_with_source(130 * MIB);

        let outcome = replicator(&store).replicate(&src(), &dst()).await.unwrap();

        assert_matches!(outcome, CopyOutcome::Completed(ref copy) if copy.part_count == 3);
        assert!(!outcome.has_warning());
        let target = store.object(&dst()).unwrap();
        assert_eq!(target.size, 130 * MIB);
        assert_eq!(
            target.metadata,
            Metadata::from([
                ("origin".to_string(), "tokyo".to_string()),
                ("add".to_string(), "metadata".to_string()),
            ])
        );
        assert_eq!(target.tags, tags());
    }

    #[tokio::test]
    async fn test_verify_target_after_copy() {
        let store = store_with_source(10 * MIB);

        let outcome = S3Replicator::builder()
            .source_store(store.clone())
            .target_store(store.clone())
            .metadata_augmentation(Metadata::from([("add".to_string(), "metadata".to_string())]))
            .verify_target(true)
            .build()
            .replicate(&src(), &dst())
            .await
            .unwrap();

        assert_matches!(outcome, CopyOutcome::Completed(_));
        // Once for the source and once for the target.
        assert_eq!(store.calls("HeadObject"), 2);
        assert_eq!(store.calls("GetObjectTagging"), 2);
    }

    #[tokio::test]
    async fn test_verify_target_reports_lost_metadata() {
        let store = store_with_source(10 * MIB);
        store.drop_metadata();

        let outcome = S3Replicator::builder()
            .source_store(store.clone())
            .target_store(store.clone())
            .verify_target(true)
            .build()
            .replicate(&src(), &dst())
            .await
            .unwrap();

        assert!(outcome.has_warning());
        assert_matches!(
            outcome,
            CopyOutcome::Unverified { error: VerificationError::MetadataMismatch { ref actual, .. }, .. }
                if actual.is_empty()
        );
        assert_eq!(store.object(&dst()).unwrap().tags, tags());
        assert_eq!(store.calls("AbortMultipartUpload"), 0);
    }

    #[tokio::test]
    async fn test_tag_failure_keeps_copy() {
        let store = store_with_source(MIB);
        store.fail_operation("PutObjectTagging", BackendErrorKind::AccessDenied);

        let outcome = replicator(&store).replicate(&src(), &dst()).await.unwrap();

        assert!(outcome.has_warning());
        assert_matches!(
            outcome,
            CopyOutcome::CompletedWithoutTags { ref error, .. } if error.count == 2
        );
        assert_eq!(store.object(&dst()).unwrap().size, MIB);
        assert!(store.object(&dst()).unwrap().tags.is_empty());
        assert_eq!(store.calls("AbortMultipartUpload"), 0);
    }

    #[tokio::test]
    async fn test_missing_source_creates_no_upload() {
        let store = Arc::new(FakeStore::default());

        let err = replicator(&store).replicate(&src(), &dst()).await.unwrap_err();

        assert_matches!(err, CopyError::SourceNotFound { .. });
        assert_eq!(store.calls("CreateMultipartUpload"), 0);
        assert!(store.object(&dst()).is_none());
    }

    #[tokio::test]
    async fn test_part_failure_applies_no_tags() {
        let store = store_with_source(130 * MIB);
        store.fail_part(2, BackendErrorKind::Transient);

        let err = replicator(&store).replicate(&src(), &dst()).await.unwrap_err();

        assert_matches!(err, CopyError::PartCopyFailed { part_number: 2, .. });
        assert_eq!(store.calls("PutObjectTagging"), 0);
        assert_eq!(store.calls("AbortMultipartUpload"), 1);
    }

    #[tokio::test]
    async fn test_reads_source_store_and_writes_target_store() {
        let source_store = store_with_source(10 * MIB);
        // Range copies are served by the target region, which can read the source.
        let target_store = store_with_source(10 * MIB);

        S3Replicator::builder()
            .source_store(source_store.clone())
            .target_store(target_store.clone())
            .part_size(PartSize::try_from(5 * MIB).unwrap())
            .build()
            .replicate(&src(), &dst())
            .await
            .unwrap();

        assert_eq!(source_store.calls("HeadObject"), 1);
        assert_eq!(source_store.calls("GetObjectTagging"), 1);
        assert_eq!(source_store.calls("CreateMultipartUpload"), 0);
        assert_eq!(target_store.calls("HeadObject"), 0);
        assert_eq!(target_store.calls("UploadPartCopy"), 2);
        assert_eq!(target_store.calls("PutObjectTagging"), 1);
        assert!(source_store.object(&dst()).is_none());
        assert_eq!(target_store.object(&dst()).unwrap().tags, tags());
    }
}
