//! An in-memory [ObjectStore] recording every call, with injectable failures and delays.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::backend::{
    BackendError, BackendErrorKind, CompletedObject, ObjectInfo, ObjectStore, UploadPartCopy,
};
use super::metadata::TagSet;
use super::multipartcopy::{CopyRange, PartResult};
use super::S3Object;
use crate::types::Metadata;

#[derive(Debug, Clone)]
pub struct FakeObject {
    pub size: i64,
    pub metadata: Metadata,
    pub tags: TagSet,
    /// Source ranges the object was assembled from, in part order.
    pub ranges: Vec<CopyRange>,
}

#[derive(Debug)]
struct CopiedPart {
    e_tag: String,
    size: i64,
    range: CopyRange,
}

#[derive(Debug)]
struct FakeUpload {
    target: S3Object,
    metadata: Metadata,
    parts: HashMap<i32, CopiedPart>,
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<S3Object, FakeObject>,
    uploads: HashMap<String, FakeUpload>,
    uploads_created: u64,
    calls: Vec<&'static str>,
    dispatched_parts: Vec<i32>,
    finished_parts: Vec<i32>,
    completed_part_lists: Vec<Vec<i32>>,
    aborted_uploads: Vec<String>,
    failing_operations: HashMap<&'static str, BackendErrorKind>,
    failing_parts: HashMap<i32, BackendErrorKind>,
    part_delays: HashMap<i32, Duration>,
    default_part_delay: Duration,
    drop_metadata: bool,
    in_flight: usize,
    max_in_flight: usize,
}

impl State {
    fn call(&mut self, operation: &'static str) -> Result<(), BackendError> {
        self.calls.push(operation);
        match self.failing_operations.get(operation) {
            Some(kind) => Err(BackendError::new(*kind, operation, "injected failure")),
            None => Ok(()),
        }
    }

    fn object(&self, operation: &'static str, object: &S3Object) -> Result<&FakeObject, BackendError> {
        self.objects.get(object).ok_or_else(|| {
            BackendError::new(BackendErrorKind::NotFound, operation, format!("NoSuchKey: {object}"))
        })
    }
}

#[derive(Debug, Default)]
pub struct FakeStore {
    state: Mutex<State>,
}

impl FakeStore {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn insert_object(&self, object: &S3Object, size: i64, metadata: Metadata, tags: TagSet) {
        self.state().objects.insert(
            object.clone(),
            FakeObject {
                size,
                metadata,
                tags,
                ranges: vec![],
            },
        );
    }

    pub fn object(&self, object: &S3Object) -> Option<FakeObject> {
        self.state().objects.get(object).cloned()
    }

    /// Every call to `operation` fails with `kind` until [FakeStore::clear_failures].
    pub fn fail_operation(&self, operation: &'static str, kind: BackendErrorKind) {
        self.state().failing_operations.insert(operation, kind);
    }

    /// Copying `part_number` fails with `kind`, after its delay has elapsed.
    pub fn fail_part(&self, part_number: i32, kind: BackendErrorKind) {
        self.state().failing_parts.insert(part_number, kind);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failing_operations.clear();
        state.failing_parts.clear();
    }

    pub fn set_part_delay(&self, part_number: i32, delay: Duration) {
        self.state().part_delays.insert(part_number, delay);
    }

    pub fn set_default_part_delay(&self, delay: Duration) {
        self.state().default_part_delay = delay;
    }

    /// Uploads created from now on ignore the metadata they are given.
    pub fn drop_metadata(&self) {
        self.state().drop_metadata = true;
    }

    /// Number of calls made to `operation`, failed or not.
    pub fn calls(&self, operation: &str) -> usize {
        self.state().calls.iter().filter(|op| **op == operation).count()
    }

    /// Part numbers in the order their copies started.
    pub fn dispatched_parts(&self) -> Vec<i32> {
        self.state().dispatched_parts.clone()
    }

    /// Part numbers in the order their copies finished.
    pub fn finished_parts(&self) -> Vec<i32> {
        self.state().finished_parts.clone()
    }

    /// Part numbers of every successful completion, as sent.
    pub fn completed_part_lists(&self) -> Vec<Vec<i32>> {
        self.state().completed_part_lists.clone()
    }

    pub fn aborted_uploads(&self) -> Vec<String> {
        self.state().aborted_uploads.clone()
    }

    /// Uploads neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.state().uploads.len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn head_object(&self, object: &S3Object) -> Result<ObjectInfo, BackendError> {
        const OP: &str = "HeadObject";
        let mut state = self.state();
        state.call(OP)?;
        let found = state.object(OP, object)?;
        Ok(ObjectInfo {
            size: found.size,
            metadata: found.metadata.clone(),
        })
    }

    async fn get_object_tags(&self, object: &S3Object) -> Result<TagSet, BackendError> {
        const OP: &str = "GetObjectTagging";
        let mut state = self.state();
        state.call(OP)?;
        Ok(state.object(OP, object)?.tags.clone())
    }

    async fn create_multipart_upload(
        &self,
        target: &S3Object,
        metadata: &Metadata,
    ) -> Result<String, BackendError> {
        let mut state = self.state();
        state.call("CreateMultipartUpload")?;
        state.uploads_created += 1;
        let upload_id = format!("upload-{}", state.uploads_created);
        let metadata = match state.drop_metadata {
            true => Metadata::new(),
            false => metadata.clone(),
        };
        state.uploads.insert(
            upload_id.clone(),
            FakeUpload {
                target: target.clone(),
                metadata,
                parts: HashMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part_copy(&self, part: UploadPartCopy<'_>) -> Result<String, BackendError> {
        const OP: &str = "UploadPartCopy";
        let delay = {
            let mut state = self.state();
            state.call(OP)?;
            state.dispatched_parts.push(part.part_number);
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state
                .part_delays
                .get(&part.part_number)
                .copied()
                .unwrap_or(state.default_part_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.in_flight -= 1;
        state.finished_parts.push(part.part_number);
        if let Some(kind) = state.failing_parts.get(&part.part_number) {
            return Err(BackendError::new(
                *kind,
                OP,
                format!("injected failure of part {}", part.part_number),
            ));
        }

        let source_size = state.object(OP, part.src)?.size;
        let size = match part.range {
            CopyRange::Whole => source_size,
            CopyRange::Bytes(range) if range.end() < source_size => range.len(),
            CopyRange::Bytes(range) => {
                return Err(BackendError::new(
                    BackendErrorKind::Other,
                    OP,
                    format!("InvalidRange: {} of {source_size} bytes", range.as_string()),
                ))
            }
        };
        let upload = state.uploads.get_mut(part.upload_id).ok_or_else(|| {
            BackendError::new(BackendErrorKind::NotFound, OP, "NoSuchUpload")
        })?;
        let e_tag = format!("\"{}-{}\"", part.upload_id, part.part_number);
        upload.parts.insert(
            part.part_number,
            CopiedPart {
                e_tag: e_tag.clone(),
                size,
                range: part.range,
            },
        );
        Ok(e_tag)
    }

    async fn complete_multipart_upload(
        &self,
        target: &S3Object,
        upload_id: &str,
        parts: &[PartResult],
    ) -> Result<CompletedObject, BackendError> {
        const OP: &str = "CompleteMultipartUpload";
        let mut state = self.state();
        state.call(OP)?;

        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(BackendError::new(BackendErrorKind::Other, OP, "InvalidPartOrder"));
        }
        let upload = state
            .uploads
            .get(upload_id)
            .filter(|upload| upload.target == *target)
            .ok_or_else(|| BackendError::new(BackendErrorKind::NotFound, OP, "NoSuchUpload"))?;

        let mut size = 0;
        let mut ranges = Vec::with_capacity(parts.len());
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some(copied) if copied.e_tag == part.e_tag => {
                    size += copied.size;
                    ranges.push(copied.range);
                }
                _ => {
                    return Err(BackendError::new(
                        BackendErrorKind::Other,
                        OP,
                        format!("InvalidPart: {}", part.part_number),
                    ))
                }
            }
        }
        let metadata = upload.metadata.clone();
        state.uploads.remove(upload_id);

        state
            .completed_part_lists
            .push(parts.iter().map(|part| part.part_number).collect());
        state.objects.insert(
            target.clone(),
            FakeObject {
                size,
                metadata,
                tags: TagSet::default(),
                ranges,
            },
        );
        Ok(CompletedObject {
            object: target.clone(),
            e_tag: Some(format!("\"{upload_id}-{}\"", parts.len())),
            version_id: None,
        })
    }

    async fn abort_multipart_upload(
        &self,
        _target: &S3Object,
        upload_id: &str,
    ) -> Result<(), BackendError> {
        const OP: &str = "AbortMultipartUpload";
        let mut state = self.state();
        state.call(OP)?;
        state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| BackendError::new(BackendErrorKind::NotFound, OP, "NoSuchUpload"))?;
        state.aborted_uploads.push(upload_id.to_owned());
        Ok(())
    }

    async fn put_object_tags(&self, object: &S3Object, tags: &TagSet) -> Result<(), BackendError> {
        const OP: &str = "PutObjectTagging";
        let mut state = self.state();
        state.call(OP)?;
        let found = state.objects.get_mut(object).ok_or_else(|| {
            BackendError::new(BackendErrorKind::NotFound, OP, format!("NoSuchKey: {object}"))
        })?;
        found.tags = tags.clone();
        Ok(())
    }
}
