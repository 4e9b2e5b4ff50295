use clap::Parser;

use cobalt_s3_copy::config::CopyEnv;
use cobalt_s3_copy::lambda::{run_copy_handler, run_local_handler, running_on_lambda, CopyRequest, Error};
use cobalt_s3_copy::s3::S3Object;

/// Copy an object from the command line. All other settings are shared with the Lambda
/// function and may be given as flags or environment variables.
#[derive(Debug, Parser)]
struct Args {
    /// Object to copy, as `s3://bucket/key`.
    #[arg(long)]
    source: S3Object,
    /// Where to copy it to, as `s3://bucket/key`.
    #[arg(long)]
    target: S3Object,
    #[command(flatten)]
    env: CopyEnv,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    if running_on_lambda()? {
        return run_copy_handler().await;
    }

    let args = Args::parse();
    let request = CopyRequest {
        source: args.source,
        target: args.target,
    };
    let response = run_local_handler(request, args.env).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if response.status_code != 200 {
        std::process::exit(1);
    }
    Ok(())
}
