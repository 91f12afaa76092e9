//! `tether` binary entry point.

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    tether::run().await
}
