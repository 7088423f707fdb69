//! modcsi-core - Core types for the modcsi CSI plugin dispatcher
//!
//! This crate holds everything both sides of the plugin boundary need:
//!
//! - [`proto`] - the CSI v0 messages plus tonic clients and servers
//! - [`Endpoint`] trait - lifecycle of a pluggable CSI implementation
//! - [`Listener`], [`Conn`] and [`incoming`] - the accept side, shared by
//!   sockets and the dispatcher's in-memory bridge
//! - [`ProviderTable`], [`StaticModule`], [`ModuleEntry`] - the module contract
//! - [`parse_proto_addr`] - `scheme://address` parsing
//! - [`PluginError`] - error type for plugin operations
//!
//! # Why this crate exists
//!
//! Plugins implement `Endpoint` and export a provider table; the dispatcher
//! consumes both. Keeping the contract here lets a plugin crate depend on it
//! without depending on the dispatcher:
//!
//! ```text
//! modcsi-core ◄── modcsi-dispatcher ◄── modcsi-runtime
//!     ▲                                      │
//!     └────────── modcsi-mock ◄──────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

/// `scheme://address` endpoint strings
pub mod addr;
mod context;
mod endpoint;
mod error;
/// Listener abstraction and accepted connections
pub mod listener;
/// Socket-backed listeners
pub mod net;
/// Module contract between dispatcher and plugins
pub mod plugin;

// Proto types generated from csi/v0/csi.proto
pub mod proto {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::derive_partial_eq_without_eq)]
    #![allow(clippy::enum_variant_names)]
    #![allow(missing_docs)]

    include!("proto/csi.rs");
}

pub use addr::{Network, ProtoAddr, parse_proto_addr};
pub use context::Context;
pub use endpoint::Endpoint;
pub use error::{AddrError, PluginError};
pub use listener::{Conn, ConnInfo, ListenAddr, Listener, incoming};
pub use net::NetListener;
pub use plugin::{
    Constructor, ENDPOINTS_SYMBOL, Instance, Module, ModuleEntry, ProviderTable, StaticModule,
    Symbol,
};

// Service traits and servers, re-exported for plugin implementations
pub use proto::controller_server::{Controller, ControllerServer};
pub use proto::identity_server::{Identity, IdentityServer};
pub use proto::node_server::{Node, NodeServer};
