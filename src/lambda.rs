//! Running a copy as an AWS Lambda function, or once from the command line.
//!
//! A Lambda invocation receives a [CopyRequest] and returns a [CopyResponse] with an
//! http style status code. Configuration is taken from the environment, see [CopyEnv].

use anyhow::{Context as _, Result};
use clap::Parser;
use lambda_runtime::{service_fn, LambdaEvent};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::ffi::OsString;
use std::iter::empty;
use tracing::instrument;
use tracing_subscriber::filter::EnvFilter;

use crate::config::CopyEnv;
use crate::s3::{CopyError, CopyOutcome, S3Object, S3Replicator};

/// Re-export of [lambda_runtime::Error](https://docs.rs/lambda_runtime/latest/lambda_runtime/type.Error.html).
///
// We provide this re-export so that the user doesn't need to have lambda_runtime as a direct dependency.
pub use lambda_runtime::Error;

/// This struct is used to attempt to parse the `AWS_LAMBDA_FUNCTION_NAME` environment variable.
///
/// We assume that if this variable is present then we're running in a Lambda function.
/// https://docs.aws.amazon.com/lambda/latest/dg/configuration-envvars.html
#[derive(Debug, Parser)]
struct CheckLambda {
    #[arg(env)]
    aws_lambda_function_name: Option<String>,
}

/// Determine whether the code is being executed within an AWS Lambda.
///
/// This function can be used to write binaries that are able to run both locally
/// or as a Lambda function.
pub fn running_on_lambda() -> Result<bool> {
    let check_lambda = CheckLambda::try_parse_from(empty::<OsString>())
        .context("An error occurred while parsing environment variables for lambda detection.")?;
    Ok(check_lambda.aws_lambda_function_name.is_some())
}

/// Format all `tracing::<...>!()` calls as JSON for consumption by CloudWatch.
///
/// The level is taken from `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();
}

/// The event which triggers a copy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CopyRequest {
    pub source: S3Object,
    pub target: S3Object,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CopyStatus {
    Success,
    SuccessWithWarning,
    Failed,
}

/// The result of an invocation, with a JSON encoded body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: String,
}

impl CopyResponse {
    pub fn new(request: &CopyRequest, result: &Result<CopyOutcome, CopyError>) -> Self {
        let source = request.source.to_string();
        let target = request.target.to_string();
        match result {
            Ok(outcome) => {
                let copy = outcome.copy();
                let (status, warning) = match outcome {
                    CopyOutcome::Completed(_) => (CopyStatus::Success, None),
                    CopyOutcome::CompletedWithoutTags { error, .. } => {
                        (CopyStatus::SuccessWithWarning, Some(error.to_string()))
                    }
                    CopyOutcome::Unverified { error, .. } => {
                        (CopyStatus::SuccessWithWarning, Some(error.to_string()))
                    }
                };
                Self {
                    status_code: 200,
                    body: json!({
                        "status": status,
                        "source": source,
                        "target": target,
                        "upload_id": copy.session.upload_id(),
                        "part_count": copy.part_count,
                        "e_tag": copy.object.e_tag,
                        "version_id": copy.object.version_id,
                        "warning": warning,
                    })
                    .to_string(),
                }
            }
            Err(error) => Self {
                status_code: status_code(error),
                body: json!({
                    "status": CopyStatus::Failed,
                    "source": source,
                    "target": target,
                    "error": error.to_string(),
                })
                .to_string(),
            },
        }
    }
}

fn status_code(error: &CopyError) -> u16 {
    match error.cause() {
        CopyError::SourceNotFound { .. } => 404,
        CopyError::SourceAccessDenied { .. } => 403,
        _ => 500,
    }
}

/// Replicate the requested object, logging the full error chain of any failure.
#[instrument(skip(replicator))]
pub async fn handle_copy(replicator: &S3Replicator, request: CopyRequest) -> CopyResponse {
    let result = replicator.replicate(&request.source, &request.target).await;
    match &result {
        Ok(outcome) if outcome.has_warning() => tracing::warn!("Copy completed with warning"),
        Ok(_) => tracing::info!("Copy completed"),
        // lambda_runtime only logs the first line of an error, which can hide the cause.
        Err(e) => tracing::error!("{:?}", e),
    }
    CopyResponse::new(&request, &result)
}

/// Runs the Lambda runtime, replicating the object named in each event.
///
/// Tracing is set up and the [CopyEnv] is read once, before the first invocation.
///
/// # Example
///
/// ```no_run
/// use cobalt_s3_copy::lambda::{run_copy_handler, Error};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Error> {
///     run_copy_handler().await
/// }
/// ```
///
/// # Error handling
///
/// A failed copy is reported in the [CopyResponse] rather than failing the invocation.
/// Errors during init fail every invocation.
pub async fn run_copy_handler() -> Result<(), Error> {
    // Ideally an error in this code would cause the runtime to return an initialization error:
    // https://docs.aws.amazon.com/lambda/latest/dg/runtimes-api.html#runtimes-api-initerror
    // however this isn't currently supported by `lambda_runtime`. To work around this, we
    // capture any errors during this phase and raise them when the function is invoked.
    let init_result = async {
        init_tracing();
        let env = CopyEnv::from_env()?;
        tracing::info!("Env: {:?}", env);
        env.replicator().await
    }
    .await;
    let init_result = &init_result;

    lambda_runtime::run(service_fn(
        move |event: LambdaEvent<CopyRequest>| async move {
            let replicator = match init_result {
                Ok(x) => x,
                Err(e) => {
                    tracing::error!("{:?}", e);
                    return Err(Error::from("Failed to initialise lambda."));
                }
            };
            let (request, _context) = event.into_parts();
            Ok::<_, Error>(handle_copy(replicator, request).await)
        },
    ))
    .await
}

/// Replicates a single object outside of Lambda, configured by `env`.
pub async fn run_local_handler(request: CopyRequest, env: CopyEnv) -> Result<CopyResponse, Error> {
    init_tracing();
    tracing::info!("Env: {:?}", env);
    let replicator = env.replicator().await?;
    Ok(handle_copy(&replicator, request).await)
}
