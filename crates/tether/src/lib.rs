//! Command-line host for a supervised language server.
//!
//! `tether` launches the configured server through
//! [`tether_lsp::Supervisor`], then reads line commands from standard input
//! and answers each with one JSON line on standard output. Logs go to
//! standard error.

pub mod bootstrap;
pub mod commands;
pub mod host;
pub mod telemetry;

use std::io::{self, Write};
use std::process::ExitCode;

use tether_config::ConfigError;
use tokio::io::BufReader;
use tracing::error;

pub use bootstrap::{
    BootstrapError, ConfigLoader, StaticConfigLoader, SystemConfigLoader, bootstrap,
    bootstrap_with,
};
pub use commands::{CommandError, HostCommand};
pub use host::{Host, Reply};
pub use telemetry::{TelemetryError, TelemetryHandle};

const RUN_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::run");

/// Runs the host against the process's standard streams.
///
/// Returns success after `quit`, end of input or Ctrl-C.
pub async fn run() -> ExitCode {
    let (host, _telemetry) = match bootstrap() {
        Ok(parts) => parts,
        Err(BootstrapError::Configuration { source }) if source.clap_error().is_some() => {
            return report_cli_error(&source);
        }
        Err(failure) => {
            let mut stderr = io::stderr().lock();
            let _ = writeln!(stderr, "tether: {failure}");
            return ExitCode::FAILURE;
        }
    };

    host.autostart().await;
    let input = BufReader::new(tokio::io::stdin());
    match host.serve(input, tokio::io::stdout(), ctrl_c()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            error!(target: RUN_TARGET, error = %failure, "host I/O failed");
            ExitCode::FAILURE
        }
    }
}

/// Prints clap's own rendering; help and version requests succeed.
fn report_cli_error(error: &ConfigError) -> ExitCode {
    if let Some(clap_error) = error.clap_error() {
        let _ = clap_error.print();
    }
    if error.is_informational() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
