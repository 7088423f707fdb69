//! Listener abstraction shared by real sockets and the in-memory bridge
//!
//! An [`Endpoint`](crate::Endpoint) serves on an `Arc<dyn Listener>`. The host
//! hands it either a socket listener ([`NetListener`](crate::net::NetListener))
//! or the dispatcher's in-memory bridge; the plugin cannot tell which.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tonic::transport::server::Connected;
use tracing::warn;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Byte stream that can back a [`Conn`]
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + 'static {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Send + 'static {}

/// Address a listener is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    /// Transport family, e.g. `tcp`, `unix` or `modcsi`
    pub network: String,
    pub address: String,
}

impl ListenAddr {
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.network, self.address)
    }
}

/// Connection metadata exposed to tonic handlers via `Request::extensions`
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub local: ListenAddr,
    pub peer: Option<String>,
}

/// An accepted connection
pub struct Conn {
    io: Pin<Box<dyn AsyncIo>>,
    info: ConnInfo,
}

impl Conn {
    pub fn new(io: impl AsyncIo, info: ConnInfo) -> Self {
        Self {
            io: Box::pin(io),
            info,
        }
    }

    pub fn info(&self) -> &ConnInfo {
        &self.info
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn").field("info", &self.info).finish()
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.io.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.io.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.io.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.io.as_mut().poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.io.as_mut().poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }
}

impl Connected for Conn {
    type ConnectInfo = ConnInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.info.clone()
    }
}

/// Source of inbound connections
///
/// `accept` returns `Ok(None)` once the listener is closed; serve loops treat
/// that as a clean end of input.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next connection
    async fn accept(&self) -> io::Result<Option<Conn>>;

    /// Address for diagnostics
    fn local_addr(&self) -> ListenAddr;
}

/// Adapt a listener into the connection stream tonic's
/// `Server::serve_with_incoming` expects
///
/// The stream ends when the listener reports closed. Accept errors are
/// logged and skipped, since tonic stops serving on the first error item.
pub fn incoming(
    listener: Arc<dyn Listener>,
) -> impl Stream<Item = io::Result<Conn>> + Send + 'static {
    futures::stream::unfold(listener, |listener| async move {
        loop {
            match listener.accept().await {
                Ok(Some(conn)) => return Some((Ok(conn), listener)),
                Ok(None) => return None,
                Err(e) => {
                    warn!(addr = %listener.local_addr(), error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    })
}
