//! Endpoint lifecycle trait for CSI plugins

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::PluginError;
use crate::listener::Listener;

/// Lifecycle of a pluggable CSI implementation
///
/// A plugin exposes the three CSI service groups (`Controller`, `Identity`,
/// `Node`) through its own gRPC server, started from [`Endpoint::serve`].
/// The host never calls the service methods directly; it connects to
/// whatever listener it passed to `serve`.
///
/// # Implementation Requirements
///
/// - `serve` is long running. It returns when the listener ends, the
///   context is cancelled or `shutdown` is called.
/// - `shutdown` must make a concurrent `serve` return; the host closes the
///   listener only after `shutdown` completes.
///
/// # Example
///
/// ```ignore
/// use modcsi_core::{Context, Endpoint, Listener, PluginError, incoming};
///
/// struct MyPlugin { svc: Arc<MyService> }
///
/// #[async_trait]
/// impl Endpoint for MyPlugin {
///     async fn init(&self, _ctx: &Context) -> Result<(), PluginError> {
///         Ok(())
///     }
///
///     async fn serve(&self, ctx: &Context, listener: Arc<dyn Listener>) -> Result<(), PluginError> {
///         Server::builder()
///             .add_service(ControllerServer::from_arc(self.svc.clone()))
///             .serve_with_incoming_shutdown(incoming(listener), ctx.cancelled())
///             .await
///             .map_err(|e| PluginError::Serve(e.to_string()))
///     }
///
///     async fn shutdown(&self, _ctx: &Context) -> Result<(), PluginError> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Prepare the plugin before serving
    async fn init(&self, ctx: &Context) -> Result<(), PluginError>;

    /// Serve the CSI services on `listener` until stopped
    async fn serve(&self, ctx: &Context, listener: Arc<dyn Listener>) -> Result<(), PluginError>;

    /// Stop serving and release resources
    async fn shutdown(&self, ctx: &Context) -> Result<(), PluginError>;
}
