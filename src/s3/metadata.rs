//! Reading source object metadata and tags, and applying tags to the copy.

use std::sync::Arc;

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use super::backend::{BackendError, BackendErrorKind, ObjectStore};
use super::multipartcopy::{CopyError, SourceSize};
use super::S3Object;
use crate::types::Metadata;

/// A single object tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The ordered tags of an object, written verbatim to the copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, From, Into)]
#[serde(transparent)]
pub struct TagSet(Vec<Tag>);

impl TagSet {
    pub fn iter(&self) -> std::slice::Iter<'_, Tag> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = &'a Tag;
    type IntoIter = std::slice::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Everything about the source that is carried over to the copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceObject {
    pub object: S3Object,
    pub size: SourceSize,
    pub metadata: Metadata,
    pub tags: TagSet,
}

/// Fetches size, user metadata and tags of a source object. Read only.
#[derive(Debug, Clone)]
pub struct MetadataReader {
    store: Arc<dyn ObjectStore>,
}

impl MetadataReader {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    pub async fn read(&self, source: &S3Object) -> Result<SourceObject, CopyError> {
        let info = self
            .store
            .head_object(source)
            .await
            .map_err(|e| source_error(source, e))?;
        let size = SourceSize::try_from(info.size)?;
        let tags = self
            .store
            .get_object_tags(source)
            .await
            .map_err(|e| source_error(source, e))?;

        tracing::info!(
            size = size.as_ref(),
            metadata = ?info.metadata,
            tags = ?tags,
            "Read source object"
        );
        Ok(SourceObject {
            object: source.clone(),
            size,
            metadata: info.metadata,
            tags,
        })
    }
}

fn source_error(object: &S3Object, source: BackendError) -> CopyError {
    match source.kind() {
        BackendErrorKind::NotFound => CopyError::SourceNotFound {
            object: object.clone(),
            source,
        },
        BackendErrorKind::AccessDenied => CopyError::SourceAccessDenied {
            object: object.clone(),
            source,
        },
        _ => CopyError::SourceUnavailable {
            object: object.clone(),
            source,
        },
    }
}

/// Tags could not be applied to an otherwise complete copy.
#[derive(Debug, Error)]
#[error("Failed to apply {count} tag(s) to {target}")]
pub struct TagPropagationError {
    pub target: S3Object,
    pub count: usize,
    #[source]
    pub source: BackendError,
}

/// Writes a tag set onto the finalised target object.
#[derive(Debug, Clone)]
pub struct TagPropagator {
    store: Arc<dyn ObjectStore>,
}

impl TagPropagator {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// An empty tag set is still written, so the target ends up with exactly
    /// the tags of the source.
    #[instrument(skip(self))]
    pub async fn propagate(&self, target: &S3Object, tags: &TagSet) -> Result<(), TagPropagationError> {
        self.store
            .put_object_tags(target, tags)
            .await
            .map_err(|source| TagPropagationError {
                target: target.clone(),
                count: tags.len(),
                source,
            })?;
        tracing::info!(count = tags.len(), "Tags applied");
        Ok(())
    }
}

/// The target read back after a copy does not carry what was written to it.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("Failed to read back {target}")]
    Unreadable {
        target: S3Object,
        #[source]
        source: BackendError,
    },
    #[error("Metadata of {target} is {actual:?}, expected {expected:?}")]
    MetadataMismatch {
        target: S3Object,
        expected: Metadata,
        actual: Metadata,
    },
    #[error("Tags of {target} are {actual:?}, expected {expected:?}")]
    TagMismatch {
        target: S3Object,
        expected: TagSet,
        actual: TagSet,
    },
}

/// Reads a finished copy back and compares it with what was written.
#[derive(Debug, Clone)]
pub struct TargetVerifier {
    store: Arc<dyn ObjectStore>,
}

impl TargetVerifier {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Metadata keys are compared case insensitively, as S3 lower cases them.
    /// Tags are compared without regard to order.
    #[instrument(skip(self))]
    pub async fn verify(
        &self,
        target: &S3Object,
        metadata: &Metadata,
        tags: &TagSet,
    ) -> Result<(), VerificationError> {
        let unreadable = |source: BackendError| VerificationError::Unreadable {
            target: target.clone(),
            source,
        };
        let info = self.store.head_object(target).await.map_err(unreadable)?;
        if lower_case_keys(&info.metadata) != lower_case_keys(metadata) {
            return Err(VerificationError::MetadataMismatch {
                target: target.clone(),
                expected: metadata.clone(),
                actual: info.metadata,
            });
        }

        let actual = self.store.get_object_tags(target).await.map_err(unreadable)?;
        if sorted_tags(&actual) != sorted_tags(tags) {
            return Err(VerificationError::TagMismatch {
                target: target.clone(),
                expected: tags.clone(),
                actual,
            });
        }
        tracing::info!("Target verified");
        Ok(())
    }
}

fn lower_case_keys(metadata: &Metadata) -> Metadata {
    metadata
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.clone()))
        .collect()
}

fn sorted_tags(tags: &TagSet) -> Vec<&Tag> {
    let mut sorted: Vec<_> = tags.iter().collect();
    sorted.sort_by(|a, b| (&a.key, &a.value).cmp(&(&b.key, &b.value)));
    sorted
}
