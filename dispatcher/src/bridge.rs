//! In-memory listener/dialer pair
//!
//! [`DuplexBridge`] lets a plugin's gRPC server and the facade's gRPC client
//! talk without a socket. Each [`dial`](DuplexBridge::dial) creates a
//! `tokio::io::duplex` pair, queues one half for the accept side and returns
//! the other. The bridge is also a [`Listener`], so a plugin serves on it
//! exactly as it would on a TCP listener.
//!
//! [`dial_acked`](DuplexBridge::dial_acked) additionally hands back an
//! [`Accepted`] notice, letting a caller bound how long it waits for the
//! plugin to pick the stream up without making the dial itself block.

use std::io;

use async_trait::async_trait;
use modcsi_core::{Conn, ConnInfo, ListenAddr, Listener};
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::DispatchError;

/// Network tag reported by [`DuplexBridge::addr`]
pub const BRIDGE_NETWORK: &str = "modcsi";

/// Per-direction buffer of each in-memory stream
const STREAM_BUFFER: usize = 64 * 1024;

/// Server half waiting for an accept
struct Pending {
    stream: DuplexStream,
    accepted: oneshot::Sender<()>,
}

/// Resolves once the accept side has taken a dialed stream
#[derive(Debug)]
pub struct Accepted(oneshot::Receiver<()>);

impl Accepted {
    /// Wait for the accept.
    ///
    /// Fails with [`DispatchError::TransportClosed`] if the bridge closed
    /// while the stream was still queued.
    pub async fn wait(self) -> Result<(), DispatchError> {
        self.0.await.map_err(|_| DispatchError::TransportClosed)
    }
}

/// In-memory listener and dialer bound to one provider
pub struct DuplexBridge {
    name: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Pending>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Pending>>,
    closed: CancellationToken,
}

impl DuplexBridge {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    /// Open a stream to the accept side
    ///
    /// Never waits for a matching accept: the server half is queued and the
    /// client half returned immediately. Fails with
    /// [`DispatchError::TransportClosed`] once the bridge is closed.
    pub fn dial(&self, target: &str) -> Result<DuplexStream, DispatchError> {
        self.dial_acked(target).map(|(client, _)| client)
    }

    /// Like [`dial`](Self::dial), also returning a notice that resolves when
    /// the stream is accepted
    pub fn dial_acked(&self, target: &str) -> Result<(DuplexStream, Accepted), DispatchError> {
        let tx = self.tx.lock();
        let tx = tx.as_ref().ok_or(DispatchError::TransportClosed)?;

        let (client, server) = tokio::io::duplex(STREAM_BUFFER);
        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(Pending {
            stream: server,
            accepted: ack_tx,
        })
        .map_err(|_| DispatchError::TransportClosed)?;

        trace!(bridge = %self.name, target, "Dialed bridge");
        Ok((client, Accepted(ack_rx)))
    }

    /// Wait for the next dialed stream
    ///
    /// Returns `None` once the bridge is closed, including for calls already
    /// waiting when `close` runs.
    pub async fn accept(&self) -> Option<DuplexStream> {
        if self.closed.is_cancelled() {
            return None;
        }
        let mut rx = self.rx.lock().await;
        let pending = tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                // close could not take the lock while we held it
                drain(&mut rx);
                return None;
            }
            pending = rx.recv() => pending?,
        };

        // The dialer may have given up already
        let _ = pending.accepted.send(());
        Some(pending.stream)
    }

    /// Close the bridge
    ///
    /// Later dials fail and every accept returns `None`. Streams queued but
    /// never accepted are dropped right away, which their dialers observe as
    /// EOF. If an accept holds the queue, it drops them once it wakes.
    /// Returns `false` if the bridge was already closed.
    pub fn close(&self) -> bool {
        let Some(tx) = self.tx.lock().take() else {
            return false;
        };
        drop(tx);
        self.closed.cancel();
        if let Ok(mut rx) = self.rx.try_lock() {
            drain(&mut rx);
        }
        debug!(bridge = %self.name, "Closed bridge");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// `{network: "modcsi", address: <provider>}`, for diagnostics only
    pub fn addr(&self) -> ListenAddr {
        ListenAddr::new(BRIDGE_NETWORK, self.name.clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Pending>) {
    rx.close();
    while rx.try_recv().is_ok() {}
}

impl std::fmt::Debug for DuplexBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexBridge")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Listener for DuplexBridge {
    async fn accept(&self) -> io::Result<Option<Conn>> {
        Ok(DuplexBridge::accept(self).await.map(|stream| {
            Conn::new(
                stream,
                ConnInfo {
                    local: self.addr(),
                    peer: None,
                },
            )
        }))
    }

    fn local_addr(&self) -> ListenAddr {
        self.addr()
    }
}
