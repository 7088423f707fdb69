//! Forwarding facade
//!
//! [`ServiceFacade`] presents one bound plugin as the CSI `Controller`,
//! `Identity` and `Node` services. Every RPC dials the facade's
//! [`DuplexBridge`], builds a client for the owning service group and replays
//! the request; the plugin's response or status comes back untouched.
//!
//! ```text
//! host listener ──► outward tonic server ──► ServiceFacade
//!                                               │ dial
//!                                               ▼
//!                       plugin tonic server ◄── DuplexBridge
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use modcsi_core::proto::controller_client::ControllerClient;
use modcsi_core::proto::identity_client::IdentityClient;
use modcsi_core::proto::node_client::NodeClient;
use modcsi_core::proto::{self, controller_server, identity_server, node_server};
use modcsi_core::{
    Context, ControllerServer, Endpoint, IdentityServer, Listener, NodeServer, PluginError,
    incoming,
};
use parking_lot::Mutex;
use tonic::transport::{Channel, Server, Uri};
use tonic::{Extensions, Request, Response, Status};
use tracing::{debug, info, warn};

use crate::bridge::DuplexBridge;
use crate::error::DispatchError;
use crate::metrics::{Outcome, try_record_dial_failure, try_record_forward};

/// Authority used for in-memory channels; never resolved
const BRIDGE_URI: &str = "http://modcsi.bridge";

/// Lifecycle of a facade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacadeState {
    Created,
    Initialized,
    Serving,
    ShuttingDown,
    Closed,
}

impl fmt::Display for FacadeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FacadeState::Created => "created",
            FacadeState::Initialized => "initialized",
            FacadeState::Serving => "serving",
            FacadeState::ShuttingDown => "shutting_down",
            FacadeState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A service-group client built over a fresh channel
trait GroupClient: Send {
    const GROUP: &'static str;

    fn from_channel(channel: Channel) -> Self;
}

impl GroupClient for ControllerClient<Channel> {
    const GROUP: &'static str = "controller";

    fn from_channel(channel: Channel) -> Self {
        Self::new(channel)
    }
}

impl GroupClient for IdentityClient<Channel> {
    const GROUP: &'static str = "identity";

    fn from_channel(channel: Channel) -> Self {
        Self::new(channel)
    }
}

impl GroupClient for NodeClient<Channel> {
    const GROUP: &'static str = "node";

    fn from_channel(channel: Channel) -> Self {
        Self::new(channel)
    }
}

/// One plugin endpoint exposed through an in-memory bridge
pub struct ServiceFacade {
    provider: String,
    endpoint: Arc<dyn Endpoint>,
    bridge: Arc<DuplexBridge>,
    dial_timeout: Duration,
    state: Mutex<FacadeState>,
}

impl ServiceFacade {
    pub fn new(
        provider: impl Into<String>,
        endpoint: Arc<dyn Endpoint>,
        bridge: Arc<DuplexBridge>,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            provider: provider.into(),
            endpoint,
            bridge,
            dial_timeout,
            state: Mutex::new(FacadeState::Created),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn bridge(&self) -> &Arc<DuplexBridge> {
        &self.bridge
    }

    pub fn state(&self) -> FacadeState {
        *self.state.lock()
    }

    fn transition(&self, next: FacadeState) -> Result<(), PluginError> {
        let mut state = self.state.lock();
        if *state == FacadeState::Closed {
            return Err(PluginError::NotReady);
        }
        debug!(provider = %self.provider, from = %*state, to = %next, "Facade state change");
        *state = next;
        Ok(())
    }

    /// Run the outward gRPC server on `listener` with this facade as all
    /// three CSI services, until `signal` resolves
    pub async fn serve_outward<F>(
        self: &Arc<Self>,
        listener: Arc<dyn Listener>,
        signal: F,
    ) -> Result<(), DispatchError>
    where
        F: Future<Output = ()> + Send,
    {
        info!(
            provider = %self.provider,
            addr = %listener.local_addr(),
            "Serving CSI services"
        );

        Server::builder()
            .add_service(ControllerServer::from_arc(Arc::clone(self)))
            .add_service(IdentityServer::from_arc(Arc::clone(self)))
            .add_service(NodeServer::from_arc(Arc::clone(self)))
            .serve_with_incoming_shutdown(incoming(listener), signal)
            .await?;

        Ok(())
    }

    /// Open a channel to the plugin over the bridge
    ///
    /// Bounded by the dial timeout, which also covers waiting for the plugin
    /// to accept. A call made before the plugin serves is answered if serving
    /// starts within that time.
    async fn connect(&self) -> Result<Channel, DispatchError> {
        if self.bridge.is_closed() {
            return Err(DispatchError::TransportClosed);
        }

        let bridge = Arc::clone(&self.bridge);
        let connector = tower::service_fn(move |_: Uri| {
            let dialed = bridge.dial_acked(bridge.name());
            async move {
                let (stream, accepted) = dialed.map_err(not_connected)?;
                accepted.wait().await.map_err(not_connected)?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        });

        let endpoint = tonic::transport::Endpoint::from_static(BRIDGE_URI);

        match tokio::time::timeout(self.dial_timeout, endpoint.connect_with_connector(connector))
            .await
        {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(_)) if self.bridge.is_closed() => Err(DispatchError::TransportClosed),
            Ok(Err(e)) => Err(DispatchError::Transport(e)),
            Err(_) => Err(DispatchError::DialTimeout(self.dial_timeout)),
        }
    }

    /// Dial, build the group client, replay the request
    ///
    /// Request metadata is carried over; extensions from the outward
    /// connection are not.
    async fn forward<C, Req, Resp, F, Fut>(
        &self,
        method: &'static str,
        request: Request<Req>,
        call: F,
    ) -> Result<Response<Resp>, Status>
    where
        C: GroupClient,
        F: FnOnce(C, Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Resp>, Status>>,
    {
        let started = Instant::now();

        let channel = match self.connect().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(
                    provider = %self.provider,
                    group = C::GROUP,
                    method,
                    error = %e,
                    "Failed to reach plugin"
                );
                try_record_dial_failure(&self.provider);
                try_record_forward(
                    C::GROUP,
                    method,
                    Outcome::DialFailed,
                    started.elapsed().as_secs_f64(),
                );
                return Err(e.into());
            }
        };

        let (metadata, _, message) = request.into_parts();
        let request = Request::from_parts(metadata, Extensions::default(), message);

        let result = call(C::from_channel(channel), request).await;

        let outcome = match &result {
            Ok(_) => Outcome::Ok,
            Err(status) => {
                debug!(
                    provider = %self.provider,
                    group = C::GROUP,
                    method,
                    code = ?status.code(),
                    "Plugin returned error"
                );
                Outcome::Error
            }
        };
        try_record_forward(C::GROUP, method, outcome, started.elapsed().as_secs_f64());

        result
    }
}

fn not_connected(e: DispatchError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, e.to_string())
}

impl fmt::Debug for ServiceFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceFacade")
            .field("provider", &self.provider)
            .field("bridge", &self.bridge)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Endpoint for ServiceFacade {
    async fn init(&self, ctx: &Context) -> Result<(), PluginError> {
        if self.state() == FacadeState::Closed {
            return Err(PluginError::NotReady);
        }
        self.endpoint.init(ctx).await?;
        self.transition(FacadeState::Initialized)
    }

    /// Serve the plugin on the bridge
    ///
    /// `_listener` belongs to the host's outward server (see
    /// [`ServiceFacade::serve_outward`]); the plugin always serves on the
    /// bridge. The bridge is closed when the plugin stops serving, for any
    /// reason, so later calls fail fast instead of waiting on a dead server.
    async fn serve(&self, ctx: &Context, _listener: Arc<dyn Listener>) -> Result<(), PluginError> {
        self.transition(FacadeState::Serving)?;
        info!(
            provider = %self.provider,
            bridge = %self.bridge.addr(),
            "Starting plugin server"
        );

        let listener: Arc<dyn Listener> = self.bridge.clone();
        let result = self.endpoint.serve(ctx, listener).await;

        // Only unexpected stops are worth a warning
        if self.bridge.close() && self.state() == FacadeState::Serving {
            match &result {
                Ok(()) => warn!(provider = %self.provider, "Plugin server stopped"),
                Err(e) => warn!(provider = %self.provider, error = %e, "Plugin server failed"),
            }
        }
        result
    }

    /// Shut the plugin down, then close the bridge
    async fn shutdown(&self, ctx: &Context) -> Result<(), PluginError> {
        if self.state() == FacadeState::Closed {
            return Ok(());
        }
        self.transition(FacadeState::ShuttingDown)?;

        self.endpoint.shutdown(ctx).await?;
        self.bridge.close();

        self.transition(FacadeState::Closed)?;
        info!(provider = %self.provider, "Endpoint shut down");
        Ok(())
    }
}

// ===== CONTROLLER =====

#[async_trait]
impl controller_server::Controller for ServiceFacade {
    async fn create_volume(
        &self,
        request: Request<proto::CreateVolumeRequest>,
    ) -> Result<Response<proto::CreateVolumeResponse>, Status> {
        self.forward("CreateVolume", request, |mut c: ControllerClient<Channel>, r| async move {
            c.create_volume(r).await
        })
        .await
    }

    async fn delete_volume(
        &self,
        request: Request<proto::DeleteVolumeRequest>,
    ) -> Result<Response<proto::DeleteVolumeResponse>, Status> {
        self.forward("DeleteVolume", request, |mut c: ControllerClient<Channel>, r| async move {
            c.delete_volume(r).await
        })
        .await
    }

    async fn controller_publish_volume(
        &self,
        request: Request<proto::ControllerPublishVolumeRequest>,
    ) -> Result<Response<proto::ControllerPublishVolumeResponse>, Status> {
        self.forward(
            "ControllerPublishVolume",
            request,
            |mut c: ControllerClient<Channel>, r| async move {
                c.controller_publish_volume(r).await
            },
        )
        .await
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<proto::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<proto::ControllerUnpublishVolumeResponse>, Status> {
        self.forward(
            "ControllerUnpublishVolume",
            request,
            |mut c: ControllerClient<Channel>, r| async move {
                c.controller_unpublish_volume(r).await
            },
        )
        .await
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<proto::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<proto::ValidateVolumeCapabilitiesResponse>, Status> {
        self.forward(
            "ValidateVolumeCapabilities",
            request,
            |mut c: ControllerClient<Channel>, r| async move {
                c.validate_volume_capabilities(r).await
            },
        )
        .await
    }

    async fn list_volumes(
        &self,
        request: Request<proto::ListVolumesRequest>,
    ) -> Result<Response<proto::ListVolumesResponse>, Status> {
        self.forward("ListVolumes", request, |mut c: ControllerClient<Channel>, r| async move {
            c.list_volumes(r).await
        })
        .await
    }

    async fn get_capacity(
        &self,
        request: Request<proto::GetCapacityRequest>,
    ) -> Result<Response<proto::GetCapacityResponse>, Status> {
        self.forward("GetCapacity", request, |mut c: ControllerClient<Channel>, r| async move {
            c.get_capacity(r).await
        })
        .await
    }

    async fn controller_get_capabilities(
        &self,
        request: Request<proto::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<proto::ControllerGetCapabilitiesResponse>, Status> {
        self.forward(
            "ControllerGetCapabilities",
            request,
            |mut c: ControllerClient<Channel>, r| async move {
                c.controller_get_capabilities(r).await
            },
        )
        .await
    }
}

// ===== IDENTITY =====

#[async_trait]
impl identity_server::Identity for ServiceFacade {
    async fn get_supported_versions(
        &self,
        request: Request<proto::GetSupportedVersionsRequest>,
    ) -> Result<Response<proto::GetSupportedVersionsResponse>, Status> {
        self.forward(
            "GetSupportedVersions",
            request,
            |mut c: IdentityClient<Channel>, r| async move { c.get_supported_versions(r).await },
        )
        .await
    }

    async fn get_plugin_info(
        &self,
        request: Request<proto::GetPluginInfoRequest>,
    ) -> Result<Response<proto::GetPluginInfoResponse>, Status> {
        self.forward("GetPluginInfo", request, |mut c: IdentityClient<Channel>, r| async move {
            c.get_plugin_info(r).await
        })
        .await
    }
}

// ===== NODE =====

#[async_trait]
impl node_server::Node for ServiceFacade {
    async fn node_publish_volume(
        &self,
        request: Request<proto::NodePublishVolumeRequest>,
    ) -> Result<Response<proto::NodePublishVolumeResponse>, Status> {
        self.forward("NodePublishVolume", request, |mut c: NodeClient<Channel>, r| async move {
            c.node_publish_volume(r).await
        })
        .await
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<proto::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<proto::NodeUnpublishVolumeResponse>, Status> {
        self.forward("NodeUnpublishVolume", request, |mut c: NodeClient<Channel>, r| async move {
            c.node_unpublish_volume(r).await
        })
        .await
    }

    async fn get_node_id(
        &self,
        request: Request<proto::GetNodeIdRequest>,
    ) -> Result<Response<proto::GetNodeIdResponse>, Status> {
        self.forward("GetNodeID", request, |mut c: NodeClient<Channel>, r| async move {
            c.get_node_id(r).await
        })
        .await
    }

    async fn probe_node(
        &self,
        request: Request<proto::ProbeNodeRequest>,
    ) -> Result<Response<proto::ProbeNodeResponse>, Status> {
        self.forward("ProbeNode", request, |mut c: NodeClient<Channel>, r| async move {
            c.probe_node(r).await
        })
        .await
    }

    async fn node_get_capabilities(
        &self,
        request: Request<proto::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<proto::NodeGetCapabilitiesResponse>, Status> {
        self.forward(
            "NodeGetCapabilities",
            request,
            |mut c: NodeClient<Channel>, r| async move { c.node_get_capabilities(r).await },
        )
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use modcsi_core::proto::controller_server::Controller;
    use modcsi_core::proto::identity_server::Identity;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Endpoint that records calls and never serves
    #[derive(Default)]
    struct RecordingEndpoint {
        inits: AtomicUsize,
        shutdowns: AtomicUsize,
        fail_shutdown: bool,
    }

    #[async_trait]
    impl Endpoint for RecordingEndpoint {
        async fn init(&self, _ctx: &Context) -> Result<(), PluginError> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn serve(
            &self,
            ctx: &Context,
            _listener: Arc<dyn Listener>,
        ) -> Result<(), PluginError> {
            ctx.cancelled().await;
            Ok(())
        }

        async fn shutdown(&self, _ctx: &Context) -> Result<(), PluginError> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            if self.fail_shutdown {
                Err(PluginError::Shutdown("busy".to_string()))
            } else {
                Ok(())
            }
        }
    }

    /// Endpoint whose server fails as soon as it starts
    struct DeadEndpoint;

    #[async_trait]
    impl Endpoint for DeadEndpoint {
        async fn init(&self, _ctx: &Context) -> Result<(), PluginError> {
            Ok(())
        }

        async fn serve(
            &self,
            _ctx: &Context,
            _listener: Arc<dyn Listener>,
        ) -> Result<(), PluginError> {
            Err(PluginError::Serve("boom".to_string()))
        }

        async fn shutdown(&self, _ctx: &Context) -> Result<(), PluginError> {
            Ok(())
        }
    }

    fn facade(endpoint: Arc<RecordingEndpoint>, timeout: Duration) -> ServiceFacade {
        ServiceFacade::new(
            "recording",
            endpoint,
            Arc::new(DuplexBridge::new("recording")),
            timeout,
        )
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let endpoint = Arc::new(RecordingEndpoint::default());
        let facade = Arc::new(facade(endpoint.clone(), Duration::from_secs(1)));
        let ctx = Context::new();
        assert_eq!(facade.state(), FacadeState::Created);

        facade.init(&ctx).await.unwrap();
        assert_eq!(facade.state(), FacadeState::Initialized);
        assert_eq!(endpoint.inits.load(Ordering::SeqCst), 1);

        let serving = tokio::spawn({
            let facade = Arc::clone(&facade);
            let ctx = ctx.clone();
            async move {
                let listener: Arc<dyn Listener> = facade.bridge().clone();
                facade.serve(&ctx, listener).await
            }
        });
        tokio::task::yield_now().await;

        facade.shutdown(&ctx).await.unwrap();
        assert_eq!(facade.state(), FacadeState::Closed);
        assert!(facade.bridge().is_closed());
        assert_eq!(endpoint.shutdowns.load(Ordering::SeqCst), 1);

        ctx.cancel();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_shutdown_keeps_bridge_open() {
        let endpoint = Arc::new(RecordingEndpoint {
            fail_shutdown: true,
            ..Default::default()
        });
        let facade = facade(endpoint, Duration::from_secs(1));

        let err = facade.shutdown(&Context::new()).await.unwrap_err();
        assert_eq!(err, PluginError::Shutdown("busy".to_string()));
        assert!(!facade.bridge().is_closed());
        assert_eq!(facade.state(), FacadeState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_init_after_close_rejected() {
        let endpoint = Arc::new(RecordingEndpoint::default());
        let facade = facade(endpoint.clone(), Duration::from_secs(1));
        let ctx = Context::new();

        facade.shutdown(&ctx).await.unwrap();
        facade.shutdown(&ctx).await.unwrap();
        assert_eq!(endpoint.shutdowns.load(Ordering::SeqCst), 1);

        assert_eq!(facade.init(&ctx).await.unwrap_err(), PluginError::NotReady);
    }

    #[tokio::test]
    async fn test_forward_after_close_is_unavailable() {
        let facade = facade(Arc::new(RecordingEndpoint::default()), Duration::from_secs(5));
        facade.shutdown(&Context::new()).await.unwrap();

        let status = tokio::time::timeout(
            Duration::from_secs(1),
            facade.list_volumes(Request::new(proto::ListVolumesRequest::default())),
        )
        .await
        .expect("no hang after shutdown")
        .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn test_forward_after_plugin_dies_is_unavailable() {
        let facade = ServiceFacade::new(
            "dead",
            Arc::new(DeadEndpoint),
            Arc::new(DuplexBridge::new("dead")),
            Duration::from_millis(200),
        );
        let ctx = Context::new();
        facade.init(&ctx).await.unwrap();

        let listener: Arc<dyn Listener> = facade.bridge().clone();
        let err = facade.serve(&ctx, listener).await.unwrap_err();
        assert_eq!(err, PluginError::Serve("boom".to_string()));
        assert!(facade.bridge().is_closed());

        let status = tokio::time::timeout(
            Duration::from_secs(3),
            facade.list_volumes(Request::new(proto::ListVolumesRequest::default())),
        )
        .await
        .expect("no hang after plugin failure")
        .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert_eq!(status.message(), "transport closed");
    }

    #[tokio::test]
    async fn test_dial_timeout_bounds_unaccepted_call() {
        // Serves without ever accepting
        let endpoint = Arc::new(RecordingEndpoint::default());
        let facade = Arc::new(facade(endpoint, Duration::from_millis(100)));
        let ctx = Context::new();
        facade.init(&ctx).await.unwrap();

        let serving = tokio::spawn({
            let facade = Arc::clone(&facade);
            let ctx = ctx.clone();
            async move {
                let listener: Arc<dyn Listener> = facade.bridge().clone();
                facade.serve(&ctx, listener).await
            }
        });

        let started = Instant::now();
        let status = tokio::time::timeout(
            Duration::from_secs(3),
            facade.list_volumes(Request::new(proto::ListVolumesRequest::default())),
        )
        .await
        .expect("dial timeout bounds the call")
        .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert!(status.message().contains("dial timed out"));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(!facade.bridge().is_closed());

        facade.shutdown(&ctx).await.unwrap();
        ctx.cancel();
        serving.await.unwrap().unwrap();
    }

    #[test]
    fn test_state_display() {
        assert_eq!(FacadeState::ShuttingDown.to_string(), "shutting_down");
    }
}
