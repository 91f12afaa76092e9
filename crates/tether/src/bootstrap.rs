//! Host bootstrap: configuration, telemetry and the supervisor.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use tether_config::{Config, ConfigError};
use tether_lsp::{HostNotifier, ServerCommand, Supervisor, SupervisorOptions, TracingNotifier};

use crate::host::Host;
use crate::telemetry::{self, TelemetryError, TelemetryHandle};

const BOOTSTRAP_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::bootstrap");

/// Source of the host configuration.
pub trait ConfigLoader: Send + Sync {
    /// Loads the configuration.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] raised by the first invalid source.
    fn load(&self) -> Result<Config, ConfigError>;
}

/// Loader that reads the process arguments and environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, ConfigError> {
        Config::resolve()
    }
}

/// Loader that hands out a prepared configuration.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    /// Wraps `config`.
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, ConfigError> {
        Ok(self.config.clone())
    }
}

/// Errors surfaced during bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Underlying loader error.
        #[source]
        source: ConfigError,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
}

/// Loads configuration, installs telemetry and builds the [`Host`].
///
/// The host is not started; a configured server command is only recorded
/// so [`Host::serve`] can launch it.
///
/// # Errors
///
/// Returns [`BootstrapError::Configuration`] when the configuration cannot
/// be loaded and [`BootstrapError::Telemetry`] when logging cannot be set up.
pub fn bootstrap_with(
    loader: &dyn ConfigLoader,
    notifier: Arc<dyn HostNotifier>,
) -> Result<(Host, TelemetryHandle), BootstrapError> {
    let config = loader
        .load()
        .map_err(|source| BootstrapError::Configuration { source })?;
    let telemetry =
        telemetry::initialise(&config).map_err(|source| BootstrapError::Telemetry { source })?;

    let command = ServerCommand::from_config(&config).ok();
    let server = command
        .as_ref()
        .map_or_else(|| "<none>".to_owned(), ToString::to_string);
    info!(
        target: BOOTSTRAP_TARGET,
        event = "bootstrap_succeeded",
        server = %server,
        restart_mode = %config.restart_mode,
        "host configured"
    );

    let supervisor = Supervisor::new(SupervisorOptions::from_config(&config), notifier);
    Ok((Host::new(supervisor, command), telemetry))
}

/// Bootstraps with the process configuration and the tracing notifier.
///
/// # Errors
///
/// See [`bootstrap_with`].
pub fn bootstrap() -> Result<(Host, TelemetryHandle), BootstrapError> {
    bootstrap_with(&SystemConfigLoader, Arc::new(TracingNotifier::new()))
}
