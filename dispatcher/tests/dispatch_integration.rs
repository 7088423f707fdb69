//! Dispatch Integration Tests
//!
//! Drive the full path: registry discovery, endpoint creation, the plugin
//! serving on its bridge and CSI calls forwarded through the facade.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use modcsi_core::proto::controller_client::ControllerClient;
use modcsi_core::proto::{self, GetPluginInfoRequest, ListVolumesRequest};
use modcsi_core::{
    Context, Controller, Endpoint, Identity, IdentityServer, Instance, Listener, Module,
    NetListener, PluginError, ProviderTable, StaticModule, incoming,
};
use modcsi_dispatcher::{
    DispatchError, EndpointFactory, FacadeState, ModuleLoader, ModuleSet, ProviderRegistry,
    RegistryError, ServiceFacade,
};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tonic::{Code, Request, Response, Status};

// =============================================================================
// TEST INFRASTRUCTURE
// =============================================================================

/// Identity-only plugin that rejects every call, echoing the `x-trace`
/// request header in the status message
struct RejectingIdentity;

#[async_trait]
impl Identity for RejectingIdentity {
    async fn get_supported_versions(
        &self,
        _request: Request<proto::GetSupportedVersionsRequest>,
    ) -> Result<Response<proto::GetSupportedVersionsResponse>, Status> {
        Err(Status::failed_precondition("no versions"))
    }

    async fn get_plugin_info(
        &self,
        request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<proto::GetPluginInfoResponse>, Status> {
        let trace = request
            .metadata()
            .get("x-trace")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none")
            .to_string();
        Err(Status::already_exists(format!("trace={trace}")))
    }
}

#[derive(Default)]
struct RejectingEndpoint {
    stop: tokio_util::sync::CancellationToken,
}

#[async_trait]
impl Endpoint for RejectingEndpoint {
    async fn init(&self, _ctx: &Context) -> Result<(), PluginError> {
        Ok(())
    }

    async fn serve(&self, ctx: &Context, listener: Arc<dyn Listener>) -> Result<(), PluginError> {
        let cancelled = ctx.token().clone();
        let stop = self.stop.clone();
        tonic::transport::Server::builder()
            .add_service(IdentityServer::new(RejectingIdentity))
            .serve_with_incoming_shutdown(incoming(listener), async move {
                tokio::select! {
                    _ = cancelled.cancelled() => {}
                    _ = stop.cancelled() => {}
                }
            })
            .await
            .map_err(|e| PluginError::Serve(e.to_string()))
    }

    async fn shutdown(&self, _ctx: &Context) -> Result<(), PluginError> {
        self.stop.cancel();
        Ok(())
    }
}

fn rejecting_module() -> StaticModule {
    StaticModule::with_endpoints(
        "rejecting",
        ProviderTable::new()
            .provider("rejecting", || Instance::endpoint(RejectingEndpoint::default()))
            .provider("broken", || Instance::opaque("not an endpoint")),
    )
}

/// Loader that counts how many modules it was asked for
struct CountingLoader {
    inner: ModuleSet,
    loads: AtomicUsize,
}

impl ModuleLoader for CountingLoader {
    fn load(&self, location: &str) -> Result<Arc<dyn Module>, RegistryError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(location)
    }
}

fn factory() -> EndpointFactory {
    let set = ModuleSet::new()
        .with(modcsi_mock::module())
        .with(rejecting_module());
    let registry = ProviderRegistry::new(
        Arc::new(set),
        vec!["mock".to_string(), "rejecting".to_string()],
    );
    EndpointFactory::new(Arc::new(registry)).dial_timeout(Duration::from_secs(2))
}

/// Create, init and start serving `provider` on its bridge
async fn start(provider: &str) -> (Arc<ServiceFacade>, Context, JoinHandle<()>) {
    let ctx = Context::new();
    let facade = factory().create(&ctx, provider).await.unwrap();
    facade.init(&ctx).await.unwrap();

    let handle = tokio::spawn({
        let facade = Arc::clone(&facade);
        let ctx = ctx.clone();
        async move {
            let unused: Arc<dyn Listener> = facade.bridge().clone();
            facade.serve(&ctx, unused).await.unwrap();
        }
    });

    (facade, ctx, handle)
}

fn volume_ids(response: &proto::ListVolumesResponse) -> Vec<String> {
    response
        .entries
        .iter()
        .map(|e| e.volume_info.as_ref().unwrap().id.as_ref().unwrap().values["id"].clone())
        .collect()
}

// =============================================================================
// FORWARDING
// =============================================================================

#[tokio::test]
async fn test_list_volumes_then_clean_failure_after_shutdown() {
    let (facade, ctx, handle) = start("mock").await;

    let response = facade
        .list_volumes(Request::new(ListVolumesRequest {
            starting_token: "1".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(volume_ids(&response), ["vol-001", "vol-002", "vol-003"]);

    facade.shutdown(&ctx).await.unwrap();
    assert_eq!(facade.state(), FacadeState::Closed);

    let status = timeout(
        Duration::from_secs(1),
        facade.list_volumes(Request::new(ListVolumesRequest::default())),
    )
    .await
    .expect("call after shutdown must not hang")
    .unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);

    timeout(Duration::from_secs(5), handle)
        .await
        .expect("plugin serve returns after shutdown")
        .unwrap();
}

#[tokio::test]
async fn test_call_before_serve_is_answered_once_serving() {
    let ctx = Context::new();
    let facade = factory().create(&ctx, "mock").await.unwrap();
    facade.init(&ctx).await.unwrap();

    let pending = tokio::spawn({
        let facade = Arc::clone(&facade);
        async move {
            facade
                .list_volumes(Request::new(ListVolumesRequest::default()))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    tokio::spawn({
        let facade = Arc::clone(&facade);
        let ctx = ctx.clone();
        async move {
            let unused: Arc<dyn Listener> = facade.bridge().clone();
            facade.serve(&ctx, unused).await.unwrap();
        }
    });

    let response = timeout(Duration::from_secs(5), pending)
        .await
        .expect("answered after serve starts")
        .unwrap()
        .unwrap();
    assert_eq!(response.into_inner().entries.len(), 3);

    facade.shutdown(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_every_group_reaches_plugin() {
    let (facade, ctx, _handle) = start("mock").await;

    let info = facade
        .get_plugin_info(Request::new(GetPluginInfoRequest::default()))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info, proto::GetPluginInfoResponse::default());

    let probe = modcsi_core::Node::probe_node(
        facade.as_ref(),
        Request::new(proto::ProbeNodeRequest::default()),
    )
    .await;
    assert!(probe.is_ok());

    let capacity = facade
        .get_capacity(Request::new(proto::GetCapacityRequest::default()))
        .await;
    assert!(capacity.is_ok());

    facade.shutdown(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_plugin_error_status_passes_through() {
    let (facade, ctx, _handle) = start("rejecting").await;

    let mut request = Request::new(GetPluginInfoRequest::default());
    request
        .metadata_mut()
        .insert("x-trace", "abc123".parse().unwrap());

    let status = facade.get_plugin_info(request).await.unwrap_err();
    assert_eq!(status.code(), Code::AlreadyExists);
    assert_eq!(status.message(), "trace=abc123");

    // The plugin does not serve Controller at all
    let status = facade
        .list_volumes(Request::new(ListVolumesRequest::default()))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);

    facade.shutdown(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_calls_share_one_bridge() {
    let (facade, ctx, _handle) = start("mock").await;

    let calls = (0..16).map(|i| {
        let facade = Arc::clone(&facade);
        async move {
            facade
                .list_volumes(Request::new(ListVolumesRequest {
                    starting_token: i.to_string(),
                    ..Default::default()
                }))
                .await
        }
    });

    for result in join_all(calls).await {
        assert_eq!(volume_ids(&result.unwrap().into_inner()).len(), 3);
    }

    facade.shutdown(&ctx).await.unwrap();
}

// =============================================================================
// DIAL TIMEOUT AND SHUTDOWN
// =============================================================================

#[tokio::test]
async fn test_dial_timeout_bounds_call_when_plugin_never_serves() {
    let ctx = Context::new();
    let facade = factory()
        .dial_timeout(Duration::from_millis(200))
        .create(&ctx, "mock")
        .await
        .unwrap();
    facade.init(&ctx).await.unwrap();

    let status = timeout(
        Duration::from_secs(3),
        facade.list_volumes(Request::new(ListVolumesRequest::default())),
    )
    .await
    .expect("dial timeout bounds the call")
    .unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);
    assert!(status.message().contains("dial timed out"), "{}", status.message());

    facade.shutdown(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_calls_in_flight_during_shutdown_complete() {
    let (facade, ctx, handle) = start("mock").await;

    let calls: Vec<_> = (0..16)
        .map(|_| {
            let facade = Arc::clone(&facade);
            tokio::spawn(async move {
                facade
                    .list_volumes(Request::new(ListVolumesRequest::default()))
                    .await
            })
        })
        .collect();
    tokio::task::yield_now().await;

    facade.shutdown(&ctx).await.unwrap();

    let results = timeout(Duration::from_secs(5), join_all(calls))
        .await
        .expect("no call hangs across shutdown");
    for result in results {
        match result.unwrap() {
            Ok(response) => assert_eq!(volume_ids(&response.into_inner()).len(), 3),
            // Refused by the stopping server or the closed bridge
            Err(_) => {}
        }
    }

    timeout(Duration::from_secs(5), handle)
        .await
        .expect("plugin serve returns after shutdown")
        .unwrap();
}

// =============================================================================
// DISCOVERY AND CREATION
// =============================================================================

#[tokio::test]
async fn test_concurrent_initialize_discovers_once() {
    let loader = Arc::new(CountingLoader {
        inner: ModuleSet::new().with(modcsi_mock::module()),
        loads: AtomicUsize::new(0),
    });
    let registry = Arc::new(ProviderRegistry::new(
        loader.clone(),
        vec!["mock".to_string()],
    ));

    let ctx = Context::new();
    let results = join_all((0..16).map(|_| registry.initialize(&ctx))).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    assert_eq!(registry.provider_names(), vec!["mock".to_string()]);
}

#[tokio::test]
async fn test_concurrent_initialize_shares_failure() {
    let registry = Arc::new(ProviderRegistry::new(
        Arc::new(ModuleSet::new().with(modcsi_mock::module())),
        vec!["mock".to_string(), "lvm".to_string()],
    ));

    let ctx = Context::new();
    let results = join_all((0..8).map(|_| registry.initialize(&ctx))).await;

    let first = results[0].clone().unwrap_err();
    assert!(matches!(first, RegistryError::ModuleLoadFailure { ref location, .. } if location == "lvm"));
    assert!(results.iter().all(|r| r.as_ref().err() == Some(&first)));

    // Providers loaded before the failure stay registered
    assert!(registry.lookup("mock").is_some());
}

#[tokio::test]
async fn test_create_ignores_case() {
    let factory = factory();
    let ctx = Context::new();

    let upper = factory.create(&ctx, "MOCK").await.unwrap();
    let lower = factory.create(&ctx, "mock").await.unwrap();
    assert_eq!(upper.provider(), "mock");
    assert_eq!(lower.provider(), "mock");
}

#[tokio::test]
async fn test_create_unknown_provider() {
    let err = factory().create(&Context::new(), "nfs").await.unwrap_err();
    assert!(matches!(err, DispatchError::UnknownProvider(ref name) if name == "nfs"));

    let status: Status = err.into();
    assert_eq!(status.code(), Code::NotFound);
}

#[tokio::test]
async fn test_create_rejects_non_endpoint() {
    let err = factory()
        .create(&Context::new(), "broken")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidProviderType(ref t) if t == "&str"));
}

// =============================================================================
// OUTWARD SERVER
// =============================================================================

#[tokio::test]
async fn test_outward_server_over_tcp() {
    let (facade, ctx, _handle) = start("mock").await;

    let listener = NetListener::bind(&"tcp://127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = format!("http://{}", listener.local_addr().address);
    let listener: Arc<dyn Listener> = Arc::new(listener);

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let outward = tokio::spawn({
        let facade = Arc::clone(&facade);
        async move {
            facade
                .serve_outward(listener, async {
                    let _ = stop_rx.await;
                })
                .await
        }
    });

    let channel = tonic::transport::Endpoint::from_shared(addr)
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut client = ControllerClient::new(channel);
    let response = client
        .list_volumes(ListVolumesRequest {
            starting_token: "1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(volume_ids(&response), ["vol-001", "vol-002", "vol-003"]);
    drop(client);

    stop_tx.send(()).unwrap();
    timeout(Duration::from_secs(5), outward)
        .await
        .expect("outward server stops")
        .unwrap()
        .unwrap();

    facade.shutdown(&ctx).await.unwrap();
}
