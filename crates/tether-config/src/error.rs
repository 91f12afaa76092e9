//! Errors raised while loading configuration.

use std::sync::Arc;

use ortho_config::OrthoError;
use thiserror::Error;

/// Failure to assemble a usable [`Config`](crate::Config).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A layer could not be read or merged, or the command line was
    /// rejected. Help and version requests also arrive here.
    #[error("failed to load configuration: {0}")]
    Load(#[source] Arc<OrthoError>),
    /// A merged value failed validation.
    #[error("invalid {field}: {message}")]
    Invalid {
        /// Configuration field name.
        field: &'static str,
        /// Why the value was rejected.
        message: String,
    },
    /// No language server command was configured.
    #[error(
        "no language server command configured; set server_command in the configuration \
         file, TETHER_SERVER_COMMAND or --server-command"
    )]
    MissingServerCommand,
}

impl ConfigError {
    /// Returns the command-line error behind a load failure, if any.
    #[must_use]
    pub fn clap_error(&self) -> Option<&clap::Error> {
        let Self::Load(source) = self else {
            return None;
        };
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(source.as_ref());
        while let Some(error) = current {
            if let Some(clap_error) = error.downcast_ref::<clap::Error>() {
                return Some(clap_error);
            }
            if let Some(boxed) = error.downcast_ref::<Box<clap::Error>>() {
                return Some(boxed);
            }
            current = error.source();
        }
        None
    }

    /// Returns whether the error only carries help or version output.
    #[must_use]
    pub fn is_informational(&self) -> bool {
        self.clap_error().is_some_and(|error| {
            matches!(
                error.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            )
        })
    }
}

impl From<Arc<OrthoError>> for ConfigError {
    fn from(source: Arc<OrthoError>) -> Self {
        Self::Load(source)
    }
}
