//! Provider registry
//!
//! Discovers plugin modules named by configuration, validates their
//! exported provider tables and records every provider constructor by name.
//! Discovery runs at most once per registry; every caller of
//! [`ProviderRegistry::initialize`] observes that single outcome.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use modcsi_core::{Constructor, Context, ENDPOINTS_SYMBOL, ProviderTable};
use parking_lot::RwLock;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::{ENV_PLUGINS, parse_plugin_list};
use crate::error::RegistryError;
use crate::loader::{ModuleLoader, ModuleSet};
use crate::metrics::Metrics;

static GLOBAL: OnceLock<Arc<ProviderRegistry>> = OnceLock::new();

/// Where the module list comes from
#[derive(Debug, Clone)]
enum ModuleList {
    Fixed(Vec<String>),
    /// Read `CSI_PLUGINS` when discovery runs
    Env,
}

/// Observable lifecycle of a registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryState {
    Uninitialized,
    Initializing,
    Ready,
    Failed(RegistryError),
}

/// Provider name to constructor registry
pub struct ProviderRegistry {
    loader: Arc<dyn ModuleLoader>,
    modules: ModuleList,
    providers: RwLock<BTreeMap<String, Constructor>>,
    started: AtomicBool,
    init: OnceCell<Result<(), RegistryError>>,
}

impl ProviderRegistry {
    /// Registry that loads `locations` in order
    pub fn new(loader: Arc<dyn ModuleLoader>, locations: Vec<String>) -> Self {
        Self::with_modules(loader, ModuleList::Fixed(locations))
    }

    /// Registry that reads its module list from `CSI_PLUGINS` at discovery
    pub fn from_env(loader: Arc<dyn ModuleLoader>) -> Self {
        Self::with_modules(loader, ModuleList::Env)
    }

    fn with_modules(loader: Arc<dyn ModuleLoader>, modules: ModuleList) -> Self {
        Self {
            loader,
            modules,
            providers: RwLock::new(BTreeMap::new()),
            started: AtomicBool::new(false),
            init: OnceCell::new(),
        }
    }

    /// Run discovery once
    ///
    /// Concurrent callers wait for the single run. A failure is kept and
    /// returned to every later caller; providers registered before the
    /// failing module stay registered.
    pub async fn initialize(&self, ctx: &Context) -> Result<(), RegistryError> {
        if let Some(result) = self.init.get() {
            return result.clone();
        }
        tokio::select! {
            result = self.init.get_or_init(|| async { self.discover() }) => result.clone(),
            _ = ctx.cancelled() => Err(RegistryError::Cancelled),
        }
    }

    fn discover(&self) -> Result<(), RegistryError> {
        self.started.store(true, Ordering::Release);

        let locations = match &self.modules {
            ModuleList::Fixed(locations) => locations.clone(),
            ModuleList::Env => match std::env::var(ENV_PLUGINS) {
                Ok(raw) => parse_plugin_list(&raw)?,
                Err(_) => Vec::new(),
            },
        };

        if locations.is_empty() {
            debug!("No plugin modules configured");
        }

        let result = locations.iter().try_for_each(|location| self.load(location));

        let count = self.providers.read().len();
        if let Some(m) = Metrics::get() {
            m.set_registered_providers(count);
        }
        if let Err(e) = &result {
            warn!(error = %e, registered = count, "Plugin discovery failed");
        }
        result
    }

    fn load(&self, location: &str) -> Result<(), RegistryError> {
        let module = self.loader.load(location)?;

        let invalid = |reason: String| RegistryError::InvalidRegistrySymbol {
            location: location.to_string(),
            reason,
        };
        let symbol = module
            .lookup(ENDPOINTS_SYMBOL)
            .ok_or_else(|| invalid(format!("missing {ENDPOINTS_SYMBOL} symbol")))?;
        let table = symbol.downcast_ref::<ProviderTable>().ok_or_else(|| {
            invalid(format!(
                "{ENDPOINTS_SYMBOL} has type {}, expected a provider table",
                symbol.type_name()
            ))
        })?;

        info!(location = %location, providers = table.len(), "Loaded plugin module");

        let mut providers = self.providers.write();
        for (name, ctor) in table.iter() {
            if providers.insert(name.to_string(), Arc::clone(ctor)).is_some() {
                debug!(provider = name, location = %location, "Replacing provider");
            }
            info!(provider = name, location = %location, "Registered endpoint provider");
        }
        Ok(())
    }

    /// Find a provider, exact name first, then ignoring case
    ///
    /// Case is folded over full Unicode, not just ASCII. Returns the
    /// registered name along with the constructor.
    pub fn lookup(&self, name: &str) -> Option<(String, Constructor)> {
        let providers = self.providers.read();
        if let Some(ctor) = providers.get(name) {
            return Some((name.to_string(), Arc::clone(ctor)));
        }
        let folded = name.to_lowercase();
        providers
            .iter()
            .find(|(registered, _)| registered.to_lowercase() == folded)
            .map(|(registered, ctor)| (registered.clone(), Arc::clone(ctor)))
    }

    /// Registered provider names, sorted
    pub fn provider_names(&self) -> Vec<String> {
        self.providers.read().keys().cloned().collect()
    }

    pub fn state(&self) -> RegistryState {
        match self.init.get() {
            Some(Ok(())) => RegistryState::Ready,
            Some(Err(e)) => RegistryState::Failed(e.clone()),
            None if self.started.load(Ordering::Acquire) => RegistryState::Initializing,
            None => RegistryState::Uninitialized,
        }
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("modules", &self.modules)
            .field("providers", &self.provider_names())
            .field("state", &self.state())
            .finish()
    }
}

/// Install the process-wide registry
///
/// Fails, handing the registry back, if one is already installed.
pub fn set_global(registry: Arc<ProviderRegistry>) -> Result<(), Arc<ProviderRegistry>> {
    GLOBAL.set(registry)
}

/// The process-wide registry
///
/// Defaults to every linked module, with the module list read from
/// `CSI_PLUGINS`.
pub fn global() -> Arc<ProviderRegistry> {
    Arc::clone(
        GLOBAL.get_or_init(|| Arc::new(ProviderRegistry::from_env(Arc::new(ModuleSet::linked())))),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use modcsi_core::plugin::Module;
    use modcsi_core::{Instance, StaticModule};
    use std::sync::atomic::AtomicUsize;

    /// Loader that counts loads
    struct CountingLoader {
        inner: ModuleSet,
        loads: AtomicUsize,
    }

    impl ModuleLoader for CountingLoader {
        fn load(&self, location: &str) -> Result<Arc<dyn Module>, RegistryError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load(location)
        }
    }

    fn table(names: &[&'static str]) -> ProviderTable {
        names.iter().fold(ProviderTable::new(), |t, &name| {
            t.provider(name, move || Instance::opaque(name))
        })
    }

    #[tokio::test]
    async fn test_empty_module_list_is_ready() {
        let registry = ProviderRegistry::new(Arc::new(ModuleSet::new()), vec![]);
        assert_eq!(registry.state(), RegistryState::Uninitialized);

        registry.initialize(&Context::new()).await.unwrap();

        assert_eq!(registry.state(), RegistryState::Ready);
        assert!(registry.provider_names().is_empty());
    }

    #[tokio::test]
    async fn test_registers_every_provider() {
        let set = ModuleSet::new()
            .with(StaticModule::with_endpoints("a", table(&["alpha", "beta"])))
            .with(StaticModule::with_endpoints("b", table(&["gamma"])));
        let registry =
            ProviderRegistry::new(Arc::new(set), vec!["a".to_string(), "b".to_string()]);

        registry.initialize(&Context::new()).await.unwrap();

        assert_eq!(registry.provider_names(), vec!["alpha", "beta", "gamma"]);
    }

    #[tokio::test]
    async fn test_lookup_ignores_case() {
        let set = ModuleSet::new().with(StaticModule::with_endpoints("m", table(&["Mock"])));
        let registry = ProviderRegistry::new(Arc::new(set), vec!["m".to_string()]);
        registry.initialize(&Context::new()).await.unwrap();

        let (name, _) = registry.lookup("MOCK").expect("case-insensitive match");
        assert_eq!(name, "Mock");
        let (name, _) = registry.lookup("mock").expect("case-insensitive match");
        assert_eq!(name, "Mock");
        assert!(registry.lookup("nope").is_none());
    }

    #[tokio::test]
    async fn test_lookup_folds_non_ascii_case() {
        let set = ModuleSet::new().with(StaticModule::with_endpoints("m", table(&["Ämock"])));
        let registry = ProviderRegistry::new(Arc::new(set), vec!["m".to_string()]);
        registry.initialize(&Context::new()).await.unwrap();

        let (name, _) = registry.lookup("ämock").expect("unicode case-insensitive match");
        assert_eq!(name, "Ämock");
        let (name, _) = registry.lookup("ÄMOCK").expect("unicode case-insensitive match");
        assert_eq!(name, "Ämock");
    }

    #[tokio::test]
    async fn test_exact_match_preferred() {
        let set = ModuleSet::new().with(StaticModule::with_endpoints("m", table(&["X", "x"])));
        let registry = ProviderRegistry::new(Arc::new(set), vec!["m".to_string()]);
        registry.initialize(&Context::new()).await.unwrap();

        assert_eq!(registry.lookup("x").unwrap().0, "x");
        assert_eq!(registry.lookup("X").unwrap().0, "X");
    }

    struct FirstMarker;
    struct SecondMarker;

    #[tokio::test]
    async fn test_later_module_wins() {
        let set = ModuleSet::new()
            .with(StaticModule::with_endpoints(
                "first",
                ProviderTable::new().provider("x", || Instance::opaque(FirstMarker)),
            ))
            .with(StaticModule::with_endpoints(
                "second",
                ProviderTable::new().provider("x", || Instance::opaque(SecondMarker)),
            ));
        let registry = ProviderRegistry::new(
            Arc::new(set),
            vec!["first".to_string(), "second".to_string()],
        );
        registry.initialize(&Context::new()).await.unwrap();

        let (_, ctor) = registry.lookup("x").unwrap();
        assert!(ctor().type_name().ends_with("SecondMarker"));
        assert_eq!(registry.provider_names(), vec!["x"]);
    }

    #[tokio::test]
    async fn test_load_failure_keeps_earlier_providers() {
        let set = ModuleSet::new().with(StaticModule::with_endpoints("good", table(&["one"])));
        let registry = ProviderRegistry::new(
            Arc::new(set),
            vec!["good".to_string(), "missing".to_string()],
        );

        let err = registry.initialize(&Context::new()).await.unwrap_err();

        assert!(matches!(err, RegistryError::ModuleLoadFailure { .. }));
        assert_eq!(registry.provider_names(), vec!["one"]);
        assert_eq!(registry.state(), RegistryState::Failed(err));
    }

    #[tokio::test]
    async fn test_missing_symbol_rejected() {
        let set = ModuleSet::new().with(StaticModule::new("empty"));
        let registry = ProviderRegistry::new(Arc::new(set), vec!["empty".to_string()]);

        let err = registry.initialize(&Context::new()).await.unwrap_err();
        assert!(
            matches!(err, RegistryError::InvalidRegistrySymbol { ref reason, .. } if reason.contains("missing"))
        );
    }

    #[tokio::test]
    async fn test_wrong_symbol_shape_rejected() {
        let module = StaticModule::new("bad").export(ENDPOINTS_SYMBOL, vec!["mock".to_string()]);
        let set = ModuleSet::new().with(module);
        let registry = ProviderRegistry::new(Arc::new(set), vec!["bad".to_string()]);

        let err = registry.initialize(&Context::new()).await.unwrap_err();
        assert!(
            matches!(err, RegistryError::InvalidRegistrySymbol { ref reason, .. } if reason.contains("Vec"))
        );
    }

    #[tokio::test]
    async fn test_failure_is_sticky() {
        let loader = Arc::new(CountingLoader {
            inner: ModuleSet::new(),
            loads: AtomicUsize::new(0),
        });
        let registry = ProviderRegistry::new(loader.clone(), vec!["missing".to_string()]);

        let first = registry.initialize(&Context::new()).await.unwrap_err();
        let second = registry.initialize(&Context::new()).await.unwrap_err();

        assert_eq!(first, second);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_context_does_not_poison() {
        let set = ModuleSet::new().with(StaticModule::with_endpoints("m", table(&["mock"])));
        let registry = ProviderRegistry::new(Arc::new(set), vec!["m".to_string()]);

        let ctx = Context::new();
        ctx.cancel();
        // Discovery is synchronous, so either outcome is acceptable here
        let _ = registry.initialize(&ctx).await;

        registry.initialize(&Context::new()).await.unwrap();
        assert_eq!(registry.state(), RegistryState::Ready);
    }
}
