//! modcsi runtime - host process for a CSI plugin
//!
//! Provides [`run()`] for the stock `modcsi` binary, and [`RuntimeBuilder`]
//! for hosts that link extra plugin modules or own their listener.
//!
//! # Quick start
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     modcsi_runtime::run().await
//! }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use modcsi_core::{Context, Endpoint, Listener, Module, NetListener, ProtoAddr};
use modcsi_dispatcher::config::{Config, LogFormat};
use modcsi_dispatcher::metrics::Metrics;
use modcsi_dispatcher::metrics_server::MetricsServer;
use modcsi_dispatcher::registry::{self, ProviderRegistry};
use modcsi_dispatcher::{EndpointFactory, ModuleSet};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// How long `shutdown` waits for the plugin's serve loop to return
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Run the host with settings from the environment until SIGINT or SIGTERM.
///
/// Only modules named in `CSI_PLUGINS` are discovered. The mock plugin is
/// always linked under location `mock`.
pub async fn run() -> anyhow::Result<()> {
    RuntimeBuilder::new().run().await
}

/// Builder for controlling runtime behaviour.
///
/// # Example
///
/// ```ignore
/// RuntimeBuilder::new()
///     .module(my_plugin::module())
///     .provider("lvm")
///     .metrics_addr("0.0.0.0:9090".parse()?)
///     .run()
///     .await
/// ```
pub struct RuntimeBuilder {
    modules: ModuleSet,
    provider: Option<String>,
    endpoint: Option<String>,
    metrics_addr: Option<SocketAddr>,
    listener: Option<Arc<dyn Listener>>,
}

impl RuntimeBuilder {
    /// Every linked module plus the mock plugin
    pub fn new() -> Self {
        Self {
            modules: ModuleSet::linked().with(modcsi_mock::module()),
            provider: None,
            endpoint: None,
            metrics_addr: None,
            listener: None,
        }
    }

    /// Make another module available for discovery
    pub fn module(mut self, module: impl Module + 'static) -> Self {
        self.modules = self.modules.with(module);
        self
    }

    /// Override the provider to expose.
    ///
    /// Default: `CSI_PROVIDER`, or `mock`.
    pub fn provider(mut self, name: impl Into<String>) -> Self {
        self.provider = Some(name.into());
        self
    }

    /// Override the `scheme://address` to listen on.
    ///
    /// Default: `CSI_ENDPOINT`, or `tcp://127.0.0.1:8080`.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Serve Prometheus metrics and health on `addr`.
    ///
    /// Default: `MODCSI_METRICS_ADDR`, or disabled.
    pub fn metrics_addr(mut self, addr: SocketAddr) -> Self {
        self.metrics_addr = Some(addr);
        self
    }

    /// Serve on an already bound listener instead of binding the endpoint
    pub fn listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Load config, initialise tracing and run until a shutdown signal.
    ///
    /// Blocks until shutdown.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = Config::from_env()?;
        init_tracing(&config);
        self.run_until(config, shutdown_signal()).await
    }

    /// Run with an explicit config until `signal` resolves.
    ///
    /// Does not touch the tracing subscriber.
    pub async fn run_until<F>(self, config: Config, signal: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let provider = self.provider.unwrap_or(config.provider);
        let endpoint = self.endpoint.unwrap_or(config.endpoint);
        let metrics_addr = self.metrics_addr.or(config.metrics_addr);

        // ── 1. Registry ──────────────────────────────────────────
        info!(
            provider = %provider,
            endpoint = %endpoint,
            modules = ?config.plugins,
            linked = ?self.modules.locations(),
            "Starting modcsi"
        );
        let registry = Arc::new(ProviderRegistry::new(
            Arc::new(self.modules),
            config.plugins,
        ));
        if registry::set_global(Arc::clone(&registry)).is_err() {
            warn!("Process-wide registry already installed, keeping it");
        }

        // ── 2. Metrics + HTTP server ─────────────────────────────
        let metrics_handle = match metrics_addr {
            Some(addr) => {
                Metrics::init()?;
                Some(MetricsServer::start(addr, Some(Arc::clone(&registry))))
            }
            None => None,
        };

        // ── 3. Listener ──────────────────────────────────────────
        let listener: Arc<dyn Listener> = match self.listener {
            Some(listener) => listener,
            None => {
                let addr: ProtoAddr = endpoint
                    .parse()
                    .with_context(|| format!("invalid endpoint: {endpoint}"))?;
                let listener = NetListener::bind(&addr)
                    .await
                    .with_context(|| format!("failed to listen on {addr}"))?;
                Arc::new(listener)
            }
        };

        // ── 4. Endpoint ──────────────────────────────────────────
        let ctx = Context::new();
        let facade = EndpointFactory::new(registry)
            .dial_timeout(config.dial_timeout)
            .create(&ctx, &provider)
            .await
            .context("failed to create endpoint")?;
        facade
            .init(&ctx)
            .await
            .context("endpoint init failed")?;

        // ── 5. Plugin on the bridge ──────────────────────────────
        let plugin_stopped = CancellationToken::new();
        let plugin_handle = tokio::spawn({
            let facade = Arc::clone(&facade);
            let ctx = ctx.clone();
            let listener = Arc::clone(&listener);
            let plugin_stopped = plugin_stopped.clone();
            async move {
                let result = facade.serve(&ctx, listener).await;
                if let Err(e) = &result {
                    error!(error = %e, provider = %facade.provider(), "Plugin server error");
                }
                plugin_stopped.cancel();
                result
            }
        });

        // ── 6. Outward gRPC server ───────────────────────────────
        let served = facade
            .serve_outward(listener, {
                let plugin_stopped = plugin_stopped.clone();
                async move {
                    tokio::select! {
                        _ = signal => {}
                        _ = plugin_stopped.cancelled() => {
                            warn!("Plugin server stopped, stopping CSI services");
                        }
                    }
                }
            })
            .await;
        let plugin_died = plugin_stopped.is_cancelled();

        // ── 7. Shutdown ──────────────────────────────────────────
        let shutdown = facade.shutdown(&ctx).await;
        ctx.cancel();
        let plugin_result = match tokio::time::timeout(SHUTDOWN_GRACE, plugin_handle).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(e)) => {
                error!(error = %e, "Plugin server task panicked");
                None
            }
            Err(_) => {
                warn!(provider = %facade.provider(), "Plugin server did not stop in time");
                None
            }
        };
        if let Some(handle) = metrics_handle {
            handle.abort();
        }

        if plugin_died {
            return Err(match plugin_result {
                Some(Err(e)) => anyhow::Error::new(e).context("plugin server failed"),
                _ => anyhow::anyhow!("plugin server stopped unexpectedly"),
            });
        }
        served.context("grpc failed")?;
        shutdown.context("endpoint shutdown failed")?;
        info!("modcsi shutdown complete");

        Ok(())
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialise the tracing subscriber based on config.
fn init_tracing(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.log_format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Pretty => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = ?e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_links_mock() {
        let builder = RuntimeBuilder::new();
        assert!(builder.modules.locations().contains(&"mock"));
        assert!(builder.provider.is_none());
        assert!(builder.listener.is_none());
    }

    #[test]
    fn test_builder_overrides() {
        let builder = RuntimeBuilder::default()
            .provider("lvm")
            .endpoint("unix:///run/csi.sock")
            .metrics_addr("127.0.0.1:9090".parse().unwrap());
        assert_eq!(builder.provider.as_deref(), Some("lvm"));
        assert_eq!(builder.endpoint.as_deref(), Some("unix:///run/csi.sock"));
        assert_eq!(builder.metrics_addr.unwrap().port(), 9090);
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_fatal() {
        let err = RuntimeBuilder::new()
            .endpoint("127.0.0.1:8080")
            .run_until(Config::default(), std::future::pending())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("invalid endpoint"));
    }

    #[tokio::test]
    async fn test_unsupported_network_is_fatal() {
        let err = RuntimeBuilder::new()
            .endpoint("udp://127.0.0.1:0")
            .run_until(Config::default(), std::future::pending())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("failed to listen"));
    }

    #[tokio::test]
    async fn test_unknown_provider_is_fatal() {
        let err = RuntimeBuilder::new()
            .provider("nfs")
            .endpoint("tcp://127.0.0.1:0")
            .run_until(Config::default(), std::future::pending())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "failed to create endpoint");
        assert!(format!("{err:#}").contains("unknown provider: nfs"));
    }
}
