use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Error, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use url::Url;

/// Characters escaped in a copy source key. `/` separators and the unreserved
/// characters of RFC 3986 are left as they are.
const COPY_SOURCE_KEY: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// A bucket key pair locating an object, with conversion from `s3://` urls.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Serialize, Deserialize)]
pub struct S3Object {
    /// The bucket the object is in.
    pub bucket: String,
    /// The key in the bucket for the object.
    pub key: String,
}

impl S3Object {
    /// Create a new [S3Object]. Any leading `/` will be trimmed from
    /// the key. No validation is done against the bucket or key.
    pub fn new(bucket: impl AsRef<str>, key: impl AsRef<str>) -> Self {
        S3Object {
            bucket: bucket.as_ref().to_owned(),
            key: key.as_ref().trim_start_matches('/').to_owned(),
        }
    }

    /// The `bucket/key` form expected by the `x-amz-copy-source` header, with the
    /// key percent encoded.
    pub fn copy_source(&self) -> String {
        format!(
            "{}/{}",
            self.bucket,
            utf8_percent_encode(&self.key, COPY_SOURCE_KEY)
        )
    }
}

impl fmt::Display for S3Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// The scheme must be `s3`, and both a host and a path are required.
impl TryFrom<Url> for S3Object {
    type Error = Error;

    fn try_from(value: Url) -> Result<Self, Self::Error> {
        if value.scheme() != "s3" {
            bail!("S3 URL must have a scheme of s3, got {}", value.scheme())
        }
        let bucket = value.host_str().context("S3 URL must have host")?;
        let key = value.path().trim_start_matches('/');
        if key.is_empty() {
            bail!("S3 URL must have a path")
        }
        Ok(S3Object::new(bucket, key))
    }
}

impl TryFrom<&str> for S3Object {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl FromStr for S3Object {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .parse::<Url>()
            .with_context(|| format!("Invalid S3 URL: {value}"))?
            .try_into()
    }
}
