//! Errors reported to actors and to the code which sets the simulation up.

use dslab_platform::error::PlatformError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    /// Bounded wait elapsed before the awaited condition became true.
    #[error("timeout")]
    Timeout,

    /// Host (or disk) used by the activity was turned off.
    #[error("host {0} failed")]
    HostFailure(String),

    /// Link or endpoint of a communication failed mid-transfer.
    #[error("transfer failed")]
    TransferFailure,

    /// Activity was canceled explicitly or because its predecessor did not finish.
    #[error("activity canceled")]
    Cancelled,

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Received payload has a different type than requested.
    #[error("unexpected payload type")]
    PayloadType,

    #[error("unknown actor function {0}")]
    UnknownFunction(String),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("can't read file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("can't parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Cause of an activity failure, stored until an awaiting actor reads it.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Failure {
    Host(String),
    Transfer,
}

impl From<&Failure> for SimError {
    fn from(failure: &Failure) -> Self {
        match failure {
            Failure::Host(name) => SimError::HostFailure(name.clone()),
            Failure::Transfer => SimError::TransferFailure,
        }
    }
}

pub(crate) fn read_file(path: &std::path::Path) -> Result<String, SimError> {
    std::fs::read_to_string(path).map_err(|source| SimError::Io {
        path: path.display().to_string(),
        source,
    })
}
