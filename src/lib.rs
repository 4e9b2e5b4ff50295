//! # Cobalt S3 copy
//!
//! Copies large S3 objects between buckets, and across regions, using a concurrent
//! multipart range copy built on [aws-sdk-rust](https://github.com/awslabs/aws-sdk-rust).
//! User metadata and tags of the source are carried over to the copy.
//!
//! The copy is driven by [s3::S3Replicator], which can be run as a Lambda function
//! through [lambda::run_copy_handler].
//!
//! A failed copy never leaves a partial object behind: the multipart upload is
//! aborted and the target is left untouched.
//!
//! ### About harrison.ai
//!
//! This crate is maintained by the Data Engineering team at [harrison.ai](https://harrison.ai).
//!
//! At [harrison.ai](https://harrison.ai) our mission is to create AI-as-a-medical-device solutions through
//! ventures and ultimately improve the standard of healthcare for 1 million lives every day.
//!

// Public modules

pub mod config;
#[cfg(feature = "lambda")]
pub mod lambda;
pub mod s3;
pub mod types;
// Internal shared modules
mod localstack;
