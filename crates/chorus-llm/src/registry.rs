use chorus_types::{ChorusError, Result};

use crate::config::ChorusConfig;
use crate::provider::{DynProvider, ProviderAdapter};
use crate::{AnthropicAdapter, BedrockAdapter, GeminiAdapter, OpenAiAdapter};

// ---------------------------------------------------------------------------
// ProviderRegistry
// ---------------------------------------------------------------------------

/// The configured set of adapters, in registration order.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<DynProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any existing one with the same id.
    pub fn register(&mut self, provider: impl ProviderAdapter + 'static) {
        self.register_dyn(DynProvider::new(provider));
    }

    pub fn register_dyn(&mut self, provider: DynProvider) {
        match self.providers.iter_mut().find(|p| p.id() == provider.id()) {
            Some(existing) => *existing = provider,
            None => self.providers.push(provider),
        }
    }

    pub fn get(&self, id: &str) -> Option<&DynProvider> {
        self.providers.iter().find(|p| p.id() == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.providers.iter().map(DynProvider::id).collect()
    }

    pub fn providers(&self) -> &[DynProvider] {
        &self.providers
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// The named subset, in the order given. An empty list selects everything.
    pub fn select(&self, ids: &[String]) -> Result<Vec<DynProvider>> {
        if ids.is_empty() {
            return Ok(self.providers.clone());
        }
        ids.iter()
            .map(|id| {
                self.get(id)
                    .cloned()
                    .ok_or_else(|| ChorusError::UnknownProvider(id.clone()))
            })
            .collect()
    }

    /// Register every adapter whose credentials are present in `config`.
    pub fn from_config(config: &ChorusConfig) -> Result<Self> {
        let mut registry = Self::new();
        let creds = &config.credentials;

        if creds.bedrock_api_key.is_some() {
            for adapter in BedrockAdapter::built_in(config)? {
                registry.register(adapter);
            }
        }
        if creds.google_api_key.is_some() {
            registry.register(GeminiAdapter::new(config)?);
        }
        if creds.openai_api_key.is_some() {
            registry.register(OpenAiAdapter::new(config)?);
        }
        if creds.anthropic_api_key.is_some() {
            registry.register(AnthropicAdapter::new(config)?);
        }

        if registry.is_empty() {
            return Err(ChorusError::Config(
                "No provider credentials found in configuration".to_string(),
            ));
        }

        tracing::debug!(providers = ?registry.ids(), "Provider registry built");
        Ok(registry)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
