//! modcsi - CSI plugin dispatcher
//!
//! Loads CSI plugin modules, resolves a provider by name and exposes it as
//! the CSI `Controller`, `Identity` and `Node` services. The plugin serves
//! on an in-memory bridge; the host forwards every call over it.
//!
//! ```text
//! CSI_PLUGINS ──► ProviderRegistry ──► EndpointFactory ──► ServiceFacade
//!                                                              │
//!                                            DuplexBridge ◄────┘
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod bridge;
pub mod config;
pub mod error;
pub mod facade;
pub mod factory;
pub mod loader;
pub mod metrics;
pub mod metrics_server;
pub mod registry;

pub use bridge::DuplexBridge;
pub use config::{Config, LogFormat, parse_plugin_list};
pub use error::{AddrError, DispatchError, PluginError, RegistryError, Result};
pub use facade::{FacadeState, ServiceFacade};
pub use factory::{EndpointFactory, create};
pub use loader::{ModuleLoader, ModuleSet};
pub use metrics::Metrics;
pub use metrics_server::MetricsServer;
pub use registry::{ProviderRegistry, RegistryState};
