use crate::errors::ProviderError;
use crate::types::{TurnRequest, TurnResult};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

/// Provider contract. One method; streaming and non-streaming providers both
/// resolve to the same `TurnResult` shape (streaming providers push partial
/// output through the request's chunk sink along the way).
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn execute_turn(&self, request: TurnRequest) -> Result<TurnResult, ProviderError>;
}

/// Provider identifiers mapped to instances. Constructor-injected by whatever
/// composes sessions; no process-global registry.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    default_provider: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn ModelProvider>) {
        let id = provider.id().to_string();
        if self.default_provider.is_none() {
            self.default_provider = Some(id.clone());
        }
        let _ = self.providers.insert(id, provider);
    }

    pub fn set_default(&mut self, provider_id: impl Into<String>) {
        self.default_provider = Some(provider_id.into());
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn ModelProvider>> {
        self.providers.get(provider_id).cloned()
    }

    pub fn default_provider(&self) -> Option<Arc<dyn ModelProvider>> {
        self.default_provider
            .as_deref()
            .and_then(|id| self.get(id))
    }

    pub fn resolve(&self, provider_id: Option<&str>) -> Option<Arc<dyn ModelProvider>> {
        match provider_id {
            Some(id) => self.get(id),
            None => self.default_provider(),
        }
    }
}
