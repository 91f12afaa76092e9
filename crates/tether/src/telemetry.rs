//! Structured telemetry initialisation for the host.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::{Subscriber, subscriber::SetGlobalDefaultError};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::{EnvFilter, fmt};

use tether_config::{Config, LogFormat};

static TELEMETRY_GUARD: OnceCell<()> = OnceCell::new();

/// Handle returned once telemetry is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryHandle;

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The configured log filter does not parse.
    #[error("invalid log filter {filter:?}: {source}")]
    Filter {
        /// The rejected filter expression.
        filter: String,
        /// Parser error.
        #[source]
        source: ParseError,
    },
    /// The global subscriber could not be installed.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Installs the global tracing subscriber on first use.
///
/// Later calls return a fresh [`TelemetryHandle`] without touching the
/// global state, whatever configuration they are given.
///
/// Logs always go to standard error; standard output carries host replies.
///
/// # Errors
///
/// Returns [`TelemetryError::Filter`] for an unparsable filter and
/// [`TelemetryError::Subscriber`] when another subscriber is already global.
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    TELEMETRY_GUARD
        .get_or_try_init(|| install_subscriber(config))
        .map(|()| TelemetryHandle)
}

fn install_subscriber(config: &Config) -> Result<(), TelemetryError> {
    let subscriber = build_subscriber(config.log_filter(), config.log_format())?;
    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)
}

/// Builds a subscriber writing to standard error, coloured only on a
/// terminal.
fn build_subscriber(
    filter: &str,
    format: LogFormat,
) -> Result<Box<dyn Subscriber + Send + Sync>, TelemetryError> {
    let env_filter = EnvFilter::try_new(filter).map_err(|source| TelemetryError::Filter {
        filter: filter.to_owned(),
        source,
    })?;
    let builder = fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_names(false)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_timer(fmt::time::UtcTime::rfc_3339());

    Ok(match format {
        LogFormat::Json => Box::new(builder.json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder.compact().finish()),
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(LogFormat::Json)]
    #[case(LogFormat::Compact)]
    fn both_formats_build(#[case] format: LogFormat) {
        assert!(build_subscriber("info,tether_lsp=debug", format).is_ok());
    }

    #[rstest]
    fn malformed_filters_are_reported() {
        let error = build_subscriber("tether=loud", LogFormat::Compact)
            .err()
            .expect("filter must be rejected");

        assert!(matches!(error, TelemetryError::Filter { ref filter, .. } if filter == "tether=loud"));
    }

    #[rstest]
    fn repeated_initialisation_is_idempotent() {
        let config = Config::default();

        initialise(&config).expect("first initialisation");
        initialise(&config).expect("second initialisation reuses the subscriber");
    }
}
