//! Module loading
//!
//! Configured module locations are resolved through a [`ModuleLoader`].
//! [`ModuleSet::linked`] serves every module a plugin crate submitted with
//! `inventory::submit!`, so adding a plugin means linking its crate.

use std::collections::HashMap;
use std::sync::Arc;

use modcsi_core::plugin::{Module, linked_modules};
use tracing::debug;

use crate::error::RegistryError;

/// Resolves a module location to a loaded module
pub trait ModuleLoader: Send + Sync {
    fn load(&self, location: &str) -> Result<Arc<dyn Module>, RegistryError>;
}

/// A fixed set of modules keyed by location
///
/// Adding a module at an existing location replaces it.
#[derive(Default, Clone)]
pub struct ModuleSet {
    modules: HashMap<String, Arc<dyn Module>>,
}

impl ModuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every module linked into this binary
    pub fn linked() -> Self {
        linked_modules().fold(Self::new(), |set, entry| {
            debug!(location = entry.location, "Found linked module");
            set.with((entry.module)())
        })
    }

    /// Add a module
    pub fn with(mut self, module: impl Module + 'static) -> Self {
        self.modules
            .insert(module.location().to_string(), Arc::new(module));
        self
    }

    pub fn locations(&self) -> Vec<&str> {
        let mut locations: Vec<_> = self.modules.keys().map(String::as_str).collect();
        locations.sort_unstable();
        locations
    }
}

impl std::fmt::Debug for ModuleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSet")
            .field("locations", &self.locations())
            .finish()
    }
}

impl ModuleLoader for ModuleSet {
    fn load(&self, location: &str) -> Result<Arc<dyn Module>, RegistryError> {
        self.modules
            .get(location)
            .cloned()
            .ok_or_else(|| RegistryError::ModuleLoadFailure {
                location: location.to_string(),
                reason: "no module linked at this location".to_string(),
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use modcsi_core::{ProviderTable, StaticModule};

    #[test]
    fn test_load_known_location() {
        let set = ModuleSet::new().with(StaticModule::with_endpoints("a", ProviderTable::new()));
        let module = set.load("a").unwrap();
        assert_eq!(module.location(), "a");
    }

    #[test]
    fn test_load_unknown_location_fails() {
        let set = ModuleSet::new();
        let err = set.load("missing").err().unwrap();
        assert!(matches!(
            err,
            RegistryError::ModuleLoadFailure { ref location, .. } if location == "missing"
        ));
    }

    #[test]
    fn test_with_replaces_same_location() {
        let set = ModuleSet::new()
            .with(StaticModule::new("a"))
            .with(StaticModule::with_endpoints("a", ProviderTable::new()));
        assert_eq!(set.locations(), vec!["a"]);
        assert!(
            set.load("a")
                .unwrap()
                .lookup(modcsi_core::ENDPOINTS_SYMBOL)
                .is_some()
        );
    }
}
