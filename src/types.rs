use aws_smithy_runtime_api::client::orchestrator::HttpResponse;

/// Convenience wrapper for SDK errors carrying the raw http response.
pub(crate) type SdkError<E> = aws_sdk_s3::error::SdkError<E, HttpResponse>;

/// User defined object metadata, as returned by `HeadObject`.
pub type Metadata = std::collections::HashMap<String, String>;
