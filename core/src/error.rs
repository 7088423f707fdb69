//! Error types for modcsi plugins

use thiserror::Error;

/// Error type for endpoint lifecycle operations
///
/// Returned by [`Endpoint`](crate::Endpoint) implementations from `init`,
/// `serve` and `shutdown`. The dispatcher forwards these unchanged to the
/// host, so plugins should put enough context in the message to diagnose
/// the failure without their own logs.
///
/// # Example
///
/// ```
/// use modcsi_core::PluginError;
///
/// fn open_backend() -> Result<(), PluginError> {
///     Err(PluginError::Init("backend socket missing".to_string()))
/// }
///
/// match open_backend() {
///     Ok(()) => println!("ready"),
///     Err(PluginError::Init(msg)) => println!("init failed: {}", msg),
///     Err(e) => println!("other error: {}", e),
/// }
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// Initialization failed
    ///
    /// Examples: invalid configuration, missing credentials, backend unreachable.
    #[error("initialization failed: {0}")]
    Init(String),

    /// Serving stopped with an error
    ///
    /// Returned when the plugin's RPC server fails while accepting or
    /// handling connections.
    #[error("serve failed: {0}")]
    Serve(String),

    /// Transport error
    ///
    /// Returned when the underlying listener or stream fails.
    #[error("transport error: {0}")]
    Transport(String),

    /// Not ready
    ///
    /// Returned when a lifecycle step is invoked out of order, e.g. `serve`
    /// before `init` on a plugin that requires it.
    #[error("plugin not ready")]
    NotReady,

    /// Shutdown error
    ///
    /// Examples: in-flight requests did not drain, backend refused to detach.
    #[error("shutdown error: {0}")]
    Shutdown(String),
}

/// Error returned by [`parse_proto_addr`](crate::parse_proto_addr)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    /// The input is not `scheme://address` with a supported scheme
    #[error("invalid endpoint address: {0:?}")]
    InvalidEndpointAddress(String),
}
