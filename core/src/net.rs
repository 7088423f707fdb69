//! Socket-backed [`Listener`] implementations

use std::io;

use async_trait::async_trait;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tracing::debug;

use crate::addr::{Network, ProtoAddr};
use crate::listener::{Conn, ConnInfo, ListenAddr, Listener};

/// A bound TCP or Unix domain socket
#[derive(Debug)]
pub enum NetListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl NetListener {
    /// Bind to a parsed endpoint address
    ///
    /// Only stream transports can carry gRPC: `tcp`, `tcp4`, `tcp6` and
    /// `unix`. Other families fail with [`io::ErrorKind::Unsupported`].
    /// `tcp4` and `tcp6` only bind resolved addresses of their own family.
    pub async fn bind(addr: &ProtoAddr) -> io::Result<Self> {
        let listener = match addr.network {
            n if n.is_tcp() => Self::Tcp(bind_tcp(n, &addr.address).await?),
            #[cfg(unix)]
            Network::Unix => Self::Unix(UnixListener::bind(&addr.address)?),
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("cannot listen on {other} network"),
                ));
            }
        };
        debug!(endpoint = %addr, bound = %listener.local_addr(), "Bound listener");
        Ok(listener)
    }
}

async fn bind_tcp(network: Network, address: &str) -> io::Result<TcpListener> {
    let mut last_err = None;
    for candidate in tokio::net::lookup_host(address).await? {
        let matches = match network {
            Network::Tcp4 => candidate.is_ipv4(),
            Network::Tcp6 => candidate.is_ipv6(),
            _ => true,
        };
        if !matches {
            continue;
        }
        match TcpListener::bind(candidate).await {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no {network} address for {address}"),
        )
    }))
}

#[async_trait]
impl Listener for NetListener {
    async fn accept(&self) -> io::Result<Option<Conn>> {
        let local = self.local_addr();
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok(Some(Conn::new(
                    stream,
                    ConnInfo {
                        local,
                        peer: Some(peer.to_string()),
                    },
                )))
            }
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Some(Conn::new(stream, ConnInfo { local, peer: None })))
            }
        }
    }

    fn local_addr(&self) -> ListenAddr {
        match self {
            Self::Tcp(listener) => ListenAddr::new(
                Network::Tcp.as_str(),
                listener
                    .local_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_default(),
            ),
            #[cfg(unix)]
            Self::Unix(listener) => ListenAddr::new(
                Network::Unix.as_str(),
                listener
                    .local_addr()
                    .ok()
                    .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                    .unwrap_or_default(),
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_bind_and_accept() {
        let addr: ProtoAddr = "tcp://127.0.0.1:0".parse().unwrap();
        let listener = NetListener::bind(&addr).await.unwrap();
        let local = listener.local_addr();
        assert_eq!(local.network, "tcp");

        let client = tokio::spawn({
            let target = local.address.clone();
            async move {
                let mut s = tokio::net::TcpStream::connect(target).await.unwrap();
                s.write_all(b"hi").await.unwrap();
            }
        });

        let mut conn = listener.accept().await.unwrap().expect("connection");
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert!(conn.info().peer.is_some());
        client.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_bind_reports_path() {
        let path = std::env::temp_dir().join(format!("modcsi-net-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let addr: ProtoAddr = format!("unix://{}", path.display()).parse().unwrap();

        let listener = NetListener::bind(&addr).await.unwrap();
        assert_eq!(listener.local_addr().address, path.display().to_string());

        drop(listener);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_tcp4_and_tcp6_enforce_family() {
        for input in ["tcp4://[::1]:0", "tcp6://127.0.0.1:0"] {
            let addr: ProtoAddr = input.parse().unwrap();
            let err = NetListener::bind(&addr).await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "{input}");
        }

        let addr: ProtoAddr = "tcp4://127.0.0.1:0".parse().unwrap();
        let listener = NetListener::bind(&addr).await.unwrap();
        assert!(listener.local_addr().address.starts_with("127.0.0.1:"));
    }

    #[tokio::test]
    async fn test_datagram_networks_unsupported() {
        for input in ["udp://127.0.0.1:0", "ip4://127.0.0.1", "unixgram:///tmp/x"] {
            let addr: ProtoAddr = input.parse().unwrap();
            let err = NetListener::bind(&addr).await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        }
    }
}
