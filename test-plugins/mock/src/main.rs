//! Standalone mock CSI plugin
//!
//! Serves the mock plugin directly on `CSI_ENDPOINT`
//! (default `tcp://127.0.0.1:8080`) without the dispatcher.

use std::sync::Arc;

use anyhow::Context as _;
use modcsi_core::{Context, Endpoint, Listener, NetListener, ProtoAddr};
use modcsi_mock::MockEndpoint;
use tracing::info;

const DEFAULT_ENDPOINT: &str = "tcp://127.0.0.1:8080";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let endpoint = std::env::var("CSI_ENDPOINT")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

    let addr: ProtoAddr = endpoint
        .parse()
        .with_context(|| format!("invalid endpoint: {endpoint}"))?;
    let listener: Arc<dyn Listener> = Arc::new(
        NetListener::bind(&addr)
            .await
            .with_context(|| format!("failed to listen on {addr}"))?,
    );
    info!(addr = %listener.local_addr(), "Starting mock plugin");

    let ctx = Context::new();
    tokio::spawn({
        let ctx = ctx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down");
                ctx.cancel();
            }
        }
    });

    let plugin = MockEndpoint::new();
    plugin
        .init(&ctx)
        .await
        .context("endpoint init failed")?;
    plugin.serve(&ctx, listener).await.context("grpc failed")?;

    Ok(())
}
