//! Mock CSI plugin
//!
//! Exports provider `mock` from module location `mock`. Every RPC answers
//! with an empty response except `ListVolumes`, which returns three fixed
//! volumes. Linking this crate registers the module with the dispatcher's
//! loader; the `modcsi-mock` binary serves it standalone.

use std::sync::Arc;

use async_trait::async_trait;
use modcsi_core::proto::{self, list_volumes_response};
use modcsi_core::{
    Context, Controller, ControllerServer, Endpoint, Identity, IdentityServer, Instance, Listener,
    ModuleEntry, Node, NodeServer, PluginError, ProviderTable, StaticModule, incoming,
};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::info;

/// Module location and provider name
pub const NAME: &str = "mock";

/// Volume ids returned by `ListVolumes`, in order
pub const VOLUMES: [&str; 3] = ["vol-001", "vol-002", "vol-003"];

fn volume_info(id: &str) -> proto::VolumeInfo {
    proto::VolumeInfo {
        id: Some(proto::VolumeId {
            values: [("id".to_string(), id.to_string())].into_iter().collect(),
        }),
        ..Default::default()
    }
}

/// The module this crate exports
pub fn module() -> StaticModule {
    StaticModule::with_endpoints(
        NAME,
        ProviderTable::new().provider(NAME, || Instance::endpoint(MockEndpoint::new())),
    )
}

inventory::submit! {
    ModuleEntry::new(NAME, module)
}

// ============================================================================
// Endpoint
// ============================================================================

/// Lifecycle wrapper running [`MockService`] on a listener
#[derive(Default)]
pub struct MockEndpoint {
    svc: Arc<MockService>,
    shutdown: CancellationToken,
}

impl MockEndpoint {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    async fn init(&self, _ctx: &Context) -> Result<(), PluginError> {
        info!("mock.Init");
        Ok(())
    }

    /// Runs until the context is cancelled, `shutdown` is called or the
    /// listener ends
    async fn serve(&self, ctx: &Context, listener: Arc<dyn Listener>) -> Result<(), PluginError> {
        info!(addr = %listener.local_addr(), "mock.Serve");

        let cancelled = ctx.token().clone();
        let shutdown = self.shutdown.clone();
        let signal = async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = shutdown.cancelled() => {}
            }
        };

        tonic::transport::Server::builder()
            .add_service(ControllerServer::from_arc(Arc::clone(&self.svc)))
            .add_service(IdentityServer::from_arc(Arc::clone(&self.svc)))
            .add_service(NodeServer::from_arc(Arc::clone(&self.svc)))
            .serve_with_incoming_shutdown(incoming(listener), signal)
            .await
            .map_err(|e| PluginError::Serve(e.to_string()))
    }

    async fn shutdown(&self, _ctx: &Context) -> Result<(), PluginError> {
        info!("mock.Shutdown");
        self.shutdown.cancel();
        Ok(())
    }
}

// ============================================================================
// Services
// ============================================================================

/// CSI services with canned responses
#[derive(Debug, Default)]
pub struct MockService;

#[async_trait]
impl Controller for MockService {
    async fn create_volume(
        &self,
        _request: Request<proto::CreateVolumeRequest>,
    ) -> Result<Response<proto::CreateVolumeResponse>, Status> {
        Ok(Response::new(Default::default()))
    }

    async fn delete_volume(
        &self,
        _request: Request<proto::DeleteVolumeRequest>,
    ) -> Result<Response<proto::DeleteVolumeResponse>, Status> {
        Ok(Response::new(Default::default()))
    }

    async fn controller_publish_volume(
        &self,
        _request: Request<proto::ControllerPublishVolumeRequest>,
    ) -> Result<Response<proto::ControllerPublishVolumeResponse>, Status> {
        Ok(Response::new(Default::default()))
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<proto::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<proto::ControllerUnpublishVolumeResponse>, Status> {
        Ok(Response::new(Default::default()))
    }

    async fn validate_volume_capabilities(
        &self,
        _request: Request<proto::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<proto::ValidateVolumeCapabilitiesResponse>, Status> {
        Ok(Response::new(Default::default()))
    }

    async fn list_volumes(
        &self,
        request: Request<proto::ListVolumesRequest>,
    ) -> Result<Response<proto::ListVolumesResponse>, Status> {
        let req = request.into_inner();
        info!(starting_token = %req.starting_token, "mock.ListVolumes");

        let entries = VOLUMES
            .iter()
            .map(|id| list_volumes_response::Entry {
                volume_info: Some(volume_info(id)),
            })
            .collect();

        Ok(Response::new(proto::ListVolumesResponse {
            entries,
            next_token: String::new(),
        }))
    }

    async fn get_capacity(
        &self,
        _request: Request<proto::GetCapacityRequest>,
    ) -> Result<Response<proto::GetCapacityResponse>, Status> {
        Ok(Response::new(Default::default()))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<proto::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<proto::ControllerGetCapabilitiesResponse>, Status> {
        Ok(Response::new(Default::default()))
    }
}

#[async_trait]
impl Identity for MockService {
    async fn get_supported_versions(
        &self,
        _request: Request<proto::GetSupportedVersionsRequest>,
    ) -> Result<Response<proto::GetSupportedVersionsResponse>, Status> {
        Ok(Response::new(Default::default()))
    }

    async fn get_plugin_info(
        &self,
        _request: Request<proto::GetPluginInfoRequest>,
    ) -> Result<Response<proto::GetPluginInfoResponse>, Status> {
        Ok(Response::new(Default::default()))
    }
}

#[async_trait]
impl Node for MockService {
    async fn node_publish_volume(
        &self,
        _request: Request<proto::NodePublishVolumeRequest>,
    ) -> Result<Response<proto::NodePublishVolumeResponse>, Status> {
        Ok(Response::new(Default::default()))
    }

    async fn node_unpublish_volume(
        &self,
        _request: Request<proto::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<proto::NodeUnpublishVolumeResponse>, Status> {
        Ok(Response::new(Default::default()))
    }

    async fn get_node_id(
        &self,
        _request: Request<proto::GetNodeIdRequest>,
    ) -> Result<Response<proto::GetNodeIdResponse>, Status> {
        Ok(Response::new(Default::default()))
    }

    async fn probe_node(
        &self,
        _request: Request<proto::ProbeNodeRequest>,
    ) -> Result<Response<proto::ProbeNodeResponse>, Status> {
        Ok(Response::new(Default::default()))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<proto::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<proto::NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(Default::default()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use modcsi_core::{ENDPOINTS_SYMBOL, Module};

    fn volume_id(entry: &list_volumes_response::Entry) -> String {
        entry.volume_info.as_ref().unwrap().id.as_ref().unwrap().values["id"].clone()
    }

    #[tokio::test]
    async fn test_list_volumes_returns_fixed_entries() {
        let response = MockService
            .list_volumes(Request::new(proto::ListVolumesRequest {
                starting_token: "1".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        let ids: Vec<_> = response.entries.iter().map(volume_id).collect();
        assert_eq!(ids, VOLUMES);
        assert!(response.next_token.is_empty());
    }

    #[tokio::test]
    async fn test_other_rpcs_return_empty() {
        let info = MockService
            .get_plugin_info(Request::new(Default::default()))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info, proto::GetPluginInfoResponse::default());

        let node = MockService
            .get_node_id(Request::new(Default::default()))
            .await
            .unwrap()
            .into_inner();
        assert!(node.node_id.is_none());
    }

    #[test]
    fn test_module_exports_mock_provider() {
        let module = module();
        assert_eq!(module.location(), "mock");

        let symbol = module.lookup(ENDPOINTS_SYMBOL).expect("Endpoints exported");
        let table = symbol.downcast_ref::<ProviderTable>().expect("provider table");
        let names: Vec<_> = table.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["mock"]);

        let (_, ctor) = table.iter().next().unwrap();
        assert!(ctor().into_endpoint().is_ok());
    }

    #[test]
    fn test_module_is_linked() {
        assert!(modcsi_core::plugin::linked_modules().any(|entry| entry.location == "mock"));
    }

    #[tokio::test]
    async fn test_init_and_shutdown_succeed() {
        let endpoint = MockEndpoint::new();
        let ctx = Context::new();
        endpoint.init(&ctx).await.unwrap();
        endpoint.shutdown(&ctx).await.unwrap();
        assert!(endpoint.shutdown.is_cancelled());
    }
}
