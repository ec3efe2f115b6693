//! Provider registry for dynamic provider resolution.

use std::collections::HashMap;
use std::sync::Arc;

use xregion_common::{Error, Result};

use crate::client::{ClientConfig, CloudClient};
use crate::memory::MemoryCloud;

/// Factory function type for creating region-scoped clients.
///
/// The configuration always carries a `region` entry.
pub type ProviderFactory =
    Box<dyn Fn(&ClientConfig) -> Result<Arc<dyn CloudClient>> + Send + Sync>;

/// Registry for cloud provider factories.
///
/// Allows dynamic registration and resolution of cloud clients
/// by provider name and client configuration.
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a provider factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: ProviderFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::InvalidInput(format!(
                "Provider '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a client by provider name and configuration.
    ///
    /// # Errors
    /// - Provider not found
    /// - Configuration invalid for the provider
    pub fn resolve(&self, name: &str, config: &ClientConfig) -> Result<Arc<dyn CloudClient>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Provider '{}' is not registered", name)))?;
        factory(config)
    }

    /// Get list of registered provider names.
    pub fn providers(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Check if a provider is registered.
    pub fn has_provider(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the `region` entry a factory is called with.
pub(crate) fn configured_region(config: &ClientConfig) -> Result<&str> {
    config
        .get("region")
        .and_then(|v| v.as_str())
        .filter(|region| !region.is_empty())
        .ok_or_else(|| Error::InvalidInput("Client configuration requires a 'region'".to_string()))
}

/// Create a registry with the in-memory provider registered as `memory`.
pub fn create_default_registry(cloud: Arc<MemoryCloud>) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    registry.register(
        MemoryCloud::PROVIDER_NAME,
        Box::new(move |config| {
            let region = configured_region(config)?;
            Ok(Arc::new(cloud.client(region)) as Arc<dyn CloudClient>)
        }),
    )?;

    Ok(registry)
}
