//! Shared [aws_types::SdkConfig](https://docs.rs/aws-types/latest/aws_types/sdk_config/struct.SdkConfig.html) loading,
//! and the environment settings of a copy.

use std::ffi::OsString;
use std::iter::empty;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use aws_config::retry::RetryConfig;
use aws_types::region::Region;
use aws_types::SdkConfig;
use clap::Parser;

use crate::localstack;
use crate::s3::{client_from_config, PartSize, S3Backend, S3Replicator, DEFAULT_MAX_CONCURRENT_PARTS};
use crate::types::Metadata;

/// Attempts made by the SDK for each request, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Create a shared `SdkConfig` with LocalStack support.
///
/// # Example
///
/// ```
/// use cobalt_s3_copy::config::load_from_env;
/// use cobalt_s3_copy::s3::Client;
///
/// # tokio_test::block_on(async {
/// let shared_config = load_from_env().await.unwrap();
/// let client = Client::new(&shared_config);
/// # })
/// ```
///
/// ## LocalStack
///
/// This shared `SdkConfig` supports creating clients that run on [LocalStack](https://localstack.cloud/).
///
/// If you use this config to create a client from within a Lambda function that is running on
/// LocalStack, it will automatically setup the correct endpoint.
///
/// If you use this config to create a client from outside of LocalStack but want to communicate
/// with a LocalStack instance, then set the environment variable `LOCALSTACK_HOSTNAME`:
///
/// ```shell
/// $ export LOCALSTACK_HOSTNAME=localhost
/// ```
///
/// You can also optionally set the `EDGE_PORT` variable if you need something other
/// than the default of `4566`.
///
/// See the [LocalStack configuration docs](https://docs.localstack.cloud/localstack/configuration/) for more info.
///
/// ## Errors
///
/// An error will be returned if `LOCALSTACK_HOSTNAME` is set and a valid URI cannot be constructed.
///
pub async fn load_from_env() -> Result<SdkConfig> {
    load_for_region(None, DEFAULT_MAX_ATTEMPTS).await
}

/// As [load_from_env], overriding the region when one is given.
///
/// Requests are retried by the SDK's standard retry strategy, with exponential
/// backoff, for up to `max_attempts` attempts.
pub async fn load_for_region(region: Option<String>, max_attempts: u32) -> Result<SdkConfig> {
    let mut shared_config = aws_config::from_env()
        .retry_config(RetryConfig::standard().with_max_attempts(max_attempts));
    if let Some(region) = region {
        shared_config = shared_config.region(Region::new(region));
    }
    if let Some(uri) = localstack::get_endpoint_uri()? {
        shared_config = shared_config.endpoint_url(uri.to_string());
    }
    Ok(shared_config.load().await)
}

/// Settings of a copy, read from environment variables or command line flags.
#[derive(Debug, Clone, Parser)]
#[command(about = "Copy a large S3 object with a concurrent multipart range copy")]
pub struct CopyEnv {
    /// Region of the source bucket. Defaults to the region of the environment.
    #[arg(long, env)]
    pub source_region: Option<String>,
    /// Region of the target bucket. Defaults to the region of the environment.
    #[arg(long, env)]
    pub target_region: Option<String>,
    /// Size in bytes of each copied part, between 5 MiB and 5 GiB.
    #[arg(long, env, default_value_t = PartSize::default())]
    pub part_size: PartSize,
    /// Parts copied at the same time.
    #[arg(long, env, default_value_t = DEFAULT_MAX_CONCURRENT_PARTS)]
    pub max_concurrent_parts: NonZeroUsize,
    /// Delay between starting consecutive part copies.
    #[arg(long, env)]
    pub dispatch_interval_ms: Option<u64>,
    /// Attempts made for each S3 request, including the first.
    #[arg(long, env, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,
    /// Metadata added to the target object, as comma separated `key=value` pairs.
    #[arg(long, env, value_parser = parse_metadata_entry, value_delimiter = ',')]
    pub metadata_augmentation: Vec<(String, String)>,
    /// Read the target back after the copy and warn if its metadata or tags differ.
    #[arg(long, env)]
    pub verify_target: bool,
}

fn parse_metadata_entry(entry: &str) -> Result<(String, String), String> {
    match entry.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_owned(), value.trim().to_owned()))
        }
        _ => Err(format!("expected key=value, got {entry:?}")),
    }
}

impl CopyEnv {
    /// Parse from environment variables only.
    ///
    /// Command line arguments are ignored, as LocalStack passes the handler name as an
    /// argument to image based Lambda functions.
    pub fn from_env() -> Result<Self> {
        Self::try_parse_from(empty::<OsString>())
            .context("An error occurred while parsing environment variables for the copy.")
    }

    pub fn dispatch_interval(&self) -> Option<Duration> {
        self.dispatch_interval_ms.map(Duration::from_millis)
    }

    pub fn augmentation(&self) -> Metadata {
        self.metadata_augmentation.iter().cloned().collect()
    }

    /// Build a replicator reading through a client of the source region and
    /// writing through a client of the target region.
    pub async fn replicator(&self) -> Result<S3Replicator> {
        let source_config = load_for_region(self.source_region.clone(), self.max_attempts).await?;
        let target_config = load_for_region(self.target_region.clone(), self.max_attempts).await?;
        let source_client = Arc::new(client_from_config(&source_config)?);
        let target_client = Arc::new(client_from_config(&target_config)?);

        Ok(S3Replicator::builder()
            .source_store(Arc::new(S3Backend::new(source_client)))
            .target_store(Arc::new(S3Backend::new(target_client)))
            .part_size(self.part_size)
            .max_concurrent_parts(self.max_concurrent_parts)
            .dispatch_interval(self.dispatch_interval())
            .metadata_augmentation(self.augmentation())
            .verify_target(self.verify_target)
            .build())
    }
}
