//! Error types for the dispatcher

use thiserror::Error;

pub use modcsi_core::{AddrError, PluginError};

/// Result type alias for dispatcher operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Failure of the one-time provider discovery
///
/// `Clone` so every caller of a failed initialization observes the same error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A configured module could not be loaded
    #[error("failed to load module {location:?}: {reason}")]
    ModuleLoadFailure { location: String, reason: String },

    /// A module's exported registry symbol is missing or has the wrong shape
    #[error("module {location:?}: {reason}")]
    InvalidRegistrySymbol { location: String, reason: String },

    /// The module list could not be parsed
    #[error("invalid module list: {0}")]
    Config(String),

    /// The caller's context was cancelled before discovery finished
    #[error("plugin discovery cancelled")]
    Cancelled,
}

/// Main error type for the dispatcher
#[derive(Error, Debug)]
#[allow(clippy::result_large_err)]
pub enum DispatchError {
    /// No registered provider matches the requested name
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// A provider constructor produced something that is not an endpoint
    #[error("invalid endpoint type: {0}")]
    InvalidProviderType(String),

    /// Dial attempted on a closed bridge
    #[error("transport closed")]
    TransportClosed,

    /// The plugin did not answer a dial within the configured timeout
    #[error("dial timed out after {0:?}")]
    DialTimeout(std::time::Duration),

    /// Provider discovery failed
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Error returned by the bound endpoint
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// Invalid endpoint address
    #[error(transparent)]
    Addr(#[from] AddrError),

    /// Forwarded call failed; the status is passed through as received
    #[error("forwarding failed: {0}")]
    Forwarding(tonic::Status),

    /// gRPC transport error
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Metrics error
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl From<DispatchError> for tonic::Status {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Forwarding(status) => status,
            DispatchError::UnknownProvider(name) => {
                tonic::Status::not_found(format!("unknown provider: {name}"))
            }
            DispatchError::TransportClosed => tonic::Status::unavailable("transport closed"),
            DispatchError::DialTimeout(d) => {
                tonic::Status::unavailable(format!("dial timed out after {d:?}"))
            }
            DispatchError::Transport(e) => tonic::Status::unavailable(e.to_string()),
            DispatchError::Addr(e) => tonic::Status::invalid_argument(e.to_string()),
            DispatchError::Config(msg) => tonic::Status::invalid_argument(msg),
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_status_passes_through() {
        let original = tonic::Status::already_exists("vol-001");
        let status: tonic::Status = DispatchError::Forwarding(original).into();
        assert_eq!(status.code(), tonic::Code::AlreadyExists);
        assert_eq!(status.message(), "vol-001");
    }

    #[test]
    fn test_transport_closed_is_unavailable() {
        let status: tonic::Status = DispatchError::TransportClosed.into();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[test]
    fn test_unknown_provider_is_not_found() {
        let status: tonic::Status = DispatchError::UnknownProvider("nfs".to_string()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[test]
    fn test_registry_error_is_transparent() {
        let err: DispatchError = RegistryError::ModuleLoadFailure {
            location: "csi-lvm".to_string(),
            reason: "not linked".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            r#"failed to load module "csi-lvm": not linked"#
        );
    }

    #[test]
    fn test_invalid_provider_type_names_type() {
        let err = DispatchError::InvalidProviderType("u32".to_string());
        assert_eq!(err.to_string(), "invalid endpoint type: u32");
    }
}
