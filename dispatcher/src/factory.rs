//! Endpoint factory
//!
//! Resolves a provider name against the registry, constructs the provider's
//! endpoint and wraps it in a [`ServiceFacade`] with its own bridge.

use std::sync::Arc;
use std::time::Duration;

use modcsi_core::Context;
use tracing::{debug, info};

use crate::bridge::DuplexBridge;
use crate::config::DEFAULT_DIAL_TIMEOUT;
use crate::error::{DispatchError, Result};
use crate::facade::ServiceFacade;
use crate::registry::{self, ProviderRegistry};

/// Builds facades from a provider registry
#[derive(Debug, Clone)]
pub struct EndpointFactory {
    registry: Arc<ProviderRegistry>,
    dial_timeout: Duration,
}

impl EndpointFactory {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    /// Bound on each in-memory connection made by created facades
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Create a facade for `name`
    ///
    /// Runs discovery first if it has not run yet. The name matches exactly
    /// or, failing that, ignoring case. Each call constructs a fresh endpoint
    /// and bridge.
    #[allow(clippy::result_large_err)]
    pub async fn create(&self, ctx: &Context, name: &str) -> Result<Arc<ServiceFacade>> {
        self.registry.initialize(ctx).await?;

        let (provider, ctor) = self
            .registry
            .lookup(name)
            .ok_or_else(|| DispatchError::UnknownProvider(name.to_string()))?;
        if provider != name {
            debug!(requested = name, provider = %provider, "Matched provider ignoring case");
        }

        let endpoint = ctor()
            .into_endpoint()
            .map_err(|instance| DispatchError::InvalidProviderType(instance.type_name().to_string()))?;

        let bridge = Arc::new(DuplexBridge::new(provider.clone()));
        info!(provider = %provider, bridge = %bridge.addr(), "Created endpoint");

        Ok(Arc::new(ServiceFacade::new(
            provider,
            endpoint,
            bridge,
            self.dial_timeout,
        )))
    }
}

/// Create a facade from the process-wide registry
#[allow(clippy::result_large_err)]
pub async fn create(ctx: &Context, name: &str) -> Result<Arc<ServiceFacade>> {
    EndpointFactory::new(registry::global())
        .create(ctx, name)
        .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::RegistryError;
    use crate::facade::FacadeState;
    use crate::loader::ModuleSet;
    use async_trait::async_trait;
    use modcsi_core::{Endpoint, Instance, Listener, PluginError, ProviderTable, StaticModule};

    struct Idle;

    #[async_trait]
    impl Endpoint for Idle {
        async fn init(&self, _ctx: &Context) -> std::result::Result<(), PluginError> {
            Ok(())
        }

        async fn serve(
            &self,
            _ctx: &Context,
            _listener: Arc<dyn Listener>,
        ) -> std::result::Result<(), PluginError> {
            Ok(())
        }

        async fn shutdown(&self, _ctx: &Context) -> std::result::Result<(), PluginError> {
            Ok(())
        }
    }

    fn factory(locations: &[&str]) -> EndpointFactory {
        let set = ModuleSet::new().with(StaticModule::with_endpoints(
            "idle",
            ProviderTable::new()
                .provider("Idle", || Instance::endpoint(Idle))
                .provider("opaque", || Instance::opaque(42u32)),
        ));
        let locations = locations.iter().map(|l| l.to_string()).collect();
        EndpointFactory::new(Arc::new(ProviderRegistry::new(Arc::new(set), locations)))
    }

    #[tokio::test]
    async fn test_create_runs_discovery() {
        let factory = factory(&["idle"]);
        let facade = factory.create(&Context::new(), "Idle").await.unwrap();

        assert_eq!(facade.provider(), "Idle");
        assert_eq!(facade.state(), FacadeState::Created);
        assert_eq!(facade.bridge().addr().to_string(), "modcsi://Idle");
    }

    #[tokio::test]
    async fn test_create_ignores_case() {
        let factory = factory(&["idle"]);
        let facade = factory.create(&Context::new(), "IDLE").await.unwrap();
        assert_eq!(facade.provider(), "Idle");
    }

    #[tokio::test]
    async fn test_each_create_gets_its_own_bridge() {
        let factory = factory(&["idle"]);
        let ctx = Context::new();
        let a = factory.create(&ctx, "idle").await.unwrap();
        let b = factory.create(&ctx, "idle").await.unwrap();
        assert!(!Arc::ptr_eq(a.bridge(), b.bridge()));
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let factory = factory(&["idle"]);
        let err = factory.create(&Context::new(), "nfs").await.unwrap_err();
        assert!(matches!(err, DispatchError::UnknownProvider(ref n) if n == "nfs"));
    }

    #[tokio::test]
    async fn test_non_endpoint_constructor_rejected() {
        let factory = factory(&["idle"]);
        let err = factory.create(&Context::new(), "opaque").await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidProviderType(ref t) if t == "u32"));
    }

    #[tokio::test]
    async fn test_discovery_failure_surfaces() {
        let factory = factory(&["idle", "missing"]);
        let err = factory.create(&Context::new(), "idle").await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Registry(RegistryError::ModuleLoadFailure { ref location, .. })
                if location == "missing"
        ));
    }

    #[tokio::test]
    async fn test_dial_timeout_builder() {
        let factory = factory(&["idle"]).dial_timeout(Duration::from_millis(250));
        assert_eq!(factory.dial_timeout, Duration::from_millis(250));
    }
}
