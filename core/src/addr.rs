//! `scheme://address` endpoint strings
//!
//! Endpoint addresses name a transport family and a family-specific address,
//! e.g. `tcp://127.0.0.1:8080` or `unix:///var/run/csi.sock`. Scheme matching
//! is case-insensitive; the scheme is returned as written.

use std::fmt;
use std::str::FromStr;

use crate::error::AddrError;

const SCHEME_SEPARATOR: &str = "://";

/// Transport families accepted in an endpoint address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Ip,
    Ip4,
    Ip6,
    Unix,
    UnixGram,
    UnixPacket,
}

impl Network {
    /// All supported families, in declaration order
    pub const ALL: [Network; 12] = [
        Network::Tcp,
        Network::Tcp4,
        Network::Tcp6,
        Network::Udp,
        Network::Udp4,
        Network::Udp6,
        Network::Ip,
        Network::Ip4,
        Network::Ip6,
        Network::Unix,
        Network::UnixGram,
        Network::UnixPacket,
    ];

    /// Resolve a scheme token, ignoring ASCII case
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|n| n.as_str().eq_ignore_ascii_case(scheme))
    }

    /// Canonical lowercase token
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
            Network::Ip => "ip",
            Network::Ip4 => "ip4",
            Network::Ip6 => "ip6",
            Network::Unix => "unix",
            Network::UnixGram => "unixgram",
            Network::UnixPacket => "unixpacket",
        }
    }

    /// Stream-oriented TCP family
    pub fn is_tcp(&self) -> bool {
        matches!(self, Network::Tcp | Network::Tcp4 | Network::Tcp6)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed endpoint address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtoAddr {
    /// Scheme exactly as it appeared in the input
    pub scheme: String,
    pub network: Network,
    pub address: String,
}

impl FromStr for ProtoAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AddrError::InvalidEndpointAddress(s.to_string());

        let (scheme, address) = s.split_once(SCHEME_SEPARATOR).ok_or_else(invalid)?;
        let network = Network::from_scheme(scheme).ok_or_else(invalid)?;

        // Address is a single non-empty line
        if address.is_empty() || address.contains('\n') {
            return Err(invalid());
        }

        Ok(Self {
            scheme: scheme.to_string(),
            network,
            address: address.to_string(),
        })
    }
}

impl fmt::Display for ProtoAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.scheme, SCHEME_SEPARATOR, self.address)
    }
}

/// Split `scheme://address` into `(scheme, address)`
///
/// ```
/// use modcsi_core::parse_proto_addr;
///
/// let (scheme, addr) = parse_proto_addr("UNIX:///tmp/csi.sock").unwrap();
/// assert_eq!(scheme, "UNIX");
/// assert_eq!(addr, "/tmp/csi.sock");
///
/// assert!(parse_proto_addr("http://localhost").is_err());
/// ```
pub fn parse_proto_addr(s: &str) -> Result<(String, String), AddrError> {
    let parsed: ProtoAddr = s.parse()?;
    Ok((parsed.scheme, parsed.address))
}
