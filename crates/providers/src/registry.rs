//! Provider registry, keyed by name.

use std::sync::Arc;

use crate::adapter::ChatProvider;

/// All adapters the gateway can dispatch to, in declared order.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ChatProvider>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn ChatProvider>) {
        self.providers.push(provider);
    }

    #[must_use]
    pub fn with(mut self, provider: Arc<dyn ChatProvider>) -> Self {
        self.register(provider);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ChatProvider>> {
        self.providers
            .iter()
            .find(|p| p.name() == name)
            .map(Arc::clone)
    }

    /// All registered adapters, in registration order.
    #[must_use]
    pub fn adapters(&self) -> &[Arc<dyn ChatProvider>] {
        &self.providers
    }

    /// Any registered adapter, used as the last-resort fallback when a
    /// requested provider is missing.
    #[must_use]
    pub fn any(&self) -> Option<Arc<dyn ChatProvider>> {
        self.providers.first().map(Arc::clone)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
