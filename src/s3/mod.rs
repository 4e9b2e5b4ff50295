//! Concurrent multipart range copy of S3 objects, built on the [aws_sdk_s3](https://docs.rs/aws-sdk-s3/latest/aws_sdk_s3/) crate.
//!
//! The copy is split across a few layers:
//!
//! * [ObjectStore] is the set of storage operations the copy needs, with [S3Backend]
//!   implementing it against S3.
//! * [MetadataReader] and [TagPropagator] carry user metadata and tags across, and
//!   [TargetVerifier] optionally reads them back from the copy.
//! * [MultipartCopier] plans the parts, copies them concurrently and completes or
//!   aborts the upload.
//! * [S3Replicator] ties these together for a single source and target.

use anyhow::Result;
use aws_sdk_s3::config::Builder;
use aws_types::SdkConfig;

use crate::localstack;

/// Re-export of [aws_sdk_s3::client::Client](https://docs.rs/aws-sdk-s3/latest/aws_sdk_s3/client/struct.Client.html).
///
pub use aws_sdk_s3::Client;

mod backend;
#[cfg(test)]
pub(crate) mod fake_store;
mod metadata;
mod multipartcopy;
mod replicate;
mod s3_object;

pub use backend::{
    BackendError, BackendErrorKind, CompletedObject, ObjectInfo, ObjectStore, S3Backend,
    UploadPartCopy,
};
pub use metadata::{
    MetadataReader, SourceObject, Tag, TagPropagationError, TagPropagator, TagSet,
    TargetVerifier, VerificationError,
};
pub use multipartcopy::{
    complete, copy_part, part_count, part_ranges, ByteRange, ByteRangeError, CompletedCopy,
    CopyError, CopyJob, CopyRange, MultipartCopier, PartCopyError, PartRange, PartResult,
    PartSize, PartSizeError, SourceSize, SourceSizeError, UploadSession, UploadState,
    DEFAULT_MAX_CONCURRENT_PARTS,
};
pub use replicate::{CopyOutcome, S3Replicator};
pub use s3_object::S3Object;

/// Create an S3 client from a shared config, with LocalStack support.
///
/// # Example
///
/// ```
/// use cobalt_s3_copy::config::load_from_env;
/// use cobalt_s3_copy::s3::client_from_config;
///
/// # tokio_test::block_on(async {
/// let shared_config = load_from_env().await.unwrap();
/// let client = client_from_config(&shared_config).unwrap();
/// # })
/// ```
///
/// ## LocalStack
///
/// When `LOCALSTACK_HOSTNAME` is set the client talks to LocalStack, using path style
/// addressing so that bucket names do not need to resolve as hosts.
///
/// ## Errors
///
/// An error will be returned if `LOCALSTACK_HOSTNAME` is set and a valid URI cannot be constructed.
///
pub fn client_from_config(shared_config: &SdkConfig) -> Result<Client> {
    let mut builder = Builder::from(shared_config);
    if let Some(uri) = localstack::get_endpoint_uri()? {
        builder = builder.endpoint_url(uri.to_string()).force_path_style(true);
    }
    Ok(Client::from_conf(builder.build()))
}
