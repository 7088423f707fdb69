//! Plugin module contract
//!
//! A plugin module exports one well-known symbol, [`ENDPOINTS_SYMBOL`],
//! holding a [`ProviderTable`]: provider names mapped to zero-argument
//! constructors. The dispatcher resolves modules by location, looks the
//! symbol up, checks its shape and registers every provider it finds.
//!
//! Modules are linked into the host binary and announce themselves with
//! [`inventory`]:
//!
//! ```ignore
//! fn module() -> StaticModule {
//!     StaticModule::with_endpoints(
//!         "mock",
//!         ProviderTable::new().provider("mock", || Instance::endpoint(MockEndpoint::new())),
//!     )
//! }
//!
//! inventory::submit!(ModuleEntry::new("mock", module));
//! ```

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::endpoint::Endpoint;

/// Name of the symbol every plugin module must export
pub const ENDPOINTS_SYMBOL: &str = "Endpoints";

/// Value produced by a provider constructor
///
/// The concrete type is erased; the dispatcher checks whether it is an
/// [`Endpoint`] before using it and reports [`Instance::type_name`] if not.
pub struct Instance {
    type_name: &'static str,
    value: Box<dyn Any + Send>,
}

impl Instance {
    /// Wrap an endpoint implementation
    pub fn endpoint<E: Endpoint + 'static>(endpoint: E) -> Self {
        let value: Arc<dyn Endpoint> = Arc::new(endpoint);
        Self {
            type_name: type_name::<E>(),
            value: Box::new(value),
        }
    }

    /// Wrap an arbitrary value
    ///
    /// Such an instance is rejected by the dispatcher; this exists so a module
    /// can be built from values of any type.
    pub fn opaque<T: Any + Send>(value: T) -> Self {
        Self {
            type_name: type_name::<T>(),
            value: Box::new(value),
        }
    }

    /// Concrete type the constructor produced
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Extract the endpoint, handing the instance back if it is not one
    pub fn into_endpoint(self) -> Result<Arc<dyn Endpoint>, Self> {
        let type_name = self.type_name;
        match self.value.downcast::<Arc<dyn Endpoint>>() {
            Ok(endpoint) => Ok(*endpoint),
            Err(value) => Err(Self { type_name, value }),
        }
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Zero-argument provider constructor
pub type Constructor = Arc<dyn Fn() -> Instance + Send + Sync>;

/// Provider name to constructor table exported under [`ENDPOINTS_SYMBOL`]
///
/// Entries keep insertion order; a repeated name is registered twice and the
/// later entry wins at registration time.
#[derive(Clone, Default)]
pub struct ProviderTable {
    entries: Vec<(String, Constructor)>,
}

impl ProviderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider
    pub fn provider<F>(mut self, name: impl Into<String>, ctor: F) -> Self
    where
        F: Fn() -> Instance + Send + Sync + 'static,
    {
        self.entries.push((name.into(), Arc::new(ctor)));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Constructor)> {
        self.entries.iter().map(|(name, ctor)| (name.as_str(), ctor))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ProviderTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(name, _)| name))
            .finish()
    }
}

/// A value exported by a module under a name
#[derive(Clone)]
pub struct Symbol {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl Symbol {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_name: type_name::<T>(),
            value: Arc::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Borrow the value if it has type `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Symbol")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// A loaded plugin module
pub trait Module: Send + Sync {
    /// Location the module was loaded from
    fn location(&self) -> &str;

    /// Resolve an exported symbol
    fn lookup(&self, symbol: &str) -> Option<Symbol>;
}

/// Module backed by an in-memory symbol table
#[derive(Debug, Clone)]
pub struct StaticModule {
    location: String,
    symbols: HashMap<String, Symbol>,
}

impl StaticModule {
    /// An empty module
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            symbols: HashMap::new(),
        }
    }

    /// Export `value` under `name`, replacing any previous export
    pub fn export<T: Any + Send + Sync>(mut self, name: impl Into<String>, value: T) -> Self {
        self.symbols.insert(name.into(), Symbol::new(value));
        self
    }

    /// A module exporting `table` under [`ENDPOINTS_SYMBOL`]
    pub fn with_endpoints(location: impl Into<String>, table: ProviderTable) -> Self {
        Self::new(location).export(ENDPOINTS_SYMBOL, table)
    }
}

impl Module for StaticModule {
    fn location(&self) -> &str {
        &self.location
    }

    fn lookup(&self, symbol: &str) -> Option<Symbol> {
        self.symbols.get(symbol).cloned()
    }
}

/// Link-time announcement of a plugin module
///
/// Submitted with `inventory::submit!` by plugin crates; the dispatcher's
/// loader resolves configured locations against every linked entry.
#[derive(Debug)]
pub struct ModuleEntry {
    pub location: &'static str,
    pub module: fn() -> StaticModule,
}

impl ModuleEntry {
    pub const fn new(location: &'static str, module: fn() -> StaticModule) -> Self {
        Self { location, module }
    }
}

inventory::collect!(ModuleEntry);

/// Every module entry linked into this binary
pub fn linked_modules() -> impl Iterator<Item = &'static ModuleEntry> {
    inventory::iter::<ModuleEntry>.into_iter()
}
