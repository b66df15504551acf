pub mod azure_openai;
pub mod huggingface;
pub mod token_tracker;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AiConfig;

pub use azure_openai::{AzureEmbedder, AzureOpenAiProvider};
pub use huggingface::HuggingFaceProvider;
pub use token_tracker::TokenTracker;

pub const AZURE_OPENAI: &str = "azure_openai";
pub const HUGGINGFACE: &str = "huggingface";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiMessage {
    pub role: String,
    pub content: String,
}

impl AiMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AiResponse {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

/// Per-call overrides. `None` leaves the provider's own default in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn model(&self) -> &str;

    fn is_configured(&self) -> bool;

    async fn generate(
        &self,
        messages: &[AiMessage],
        options: &GenerateOptions,
    ) -> Result<AiResponse>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

pub fn build_provider(name: &str, config: &AiConfig) -> Result<Arc<dyn AiProvider>> {
    match name {
        AZURE_OPENAI => Ok(Arc::new(AzureOpenAiProvider::new(&config.azure))),
        HUGGINGFACE => Ok(Arc::new(HuggingFaceProvider::new(&config.huggingface))),
        other => anyhow::bail!("unknown AI provider: {other}"),
    }
}

/// Uses the dedicated embedding deployment when configured, otherwise the
/// chat endpoint and key. `None` when neither is available.
pub fn build_embedder(config: &AiConfig) -> Option<Arc<dyn Embedder>> {
    AzureEmbedder::from_config(&config.azure).map(|e| Arc::new(e) as Arc<dyn Embedder>)
}

/// Records token usage after every successful generation of the wrapped
/// provider. A failed write is logged and does not fail the call.
pub struct TrackedProvider {
    inner: Arc<dyn AiProvider>,
    tracker: Arc<TokenTracker>,
}

impl TrackedProvider {
    pub fn new(inner: Arc<dyn AiProvider>, tracker: Arc<TokenTracker>) -> Self {
        Self { inner, tracker }
    }
}

#[async_trait]
impl AiProvider for TrackedProvider {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn is_configured(&self) -> bool {
        self.inner.is_configured()
    }

    async fn generate(
        &self,
        messages: &[AiMessage],
        options: &GenerateOptions,
    ) -> Result<AiResponse> {
        let response = self.inner.generate(messages, options).await?;
        if let Some(usage) = response.usage {
            if let Err(err) = self
                .tracker
                .track(&response.provider, &response.model, usage)
                .await
            {
                tracing::warn!(error = %err, "failed to persist token usage");
            }
        }
        Ok(response)
    }
}

/// Every known provider keyed by name, plus the default used when a request
/// does not ask for one.
#[derive(Clone)]
pub struct ProviderRegistry {
    default: String,
    providers: BTreeMap<String, Arc<dyn AiProvider>>,
}

impl ProviderRegistry {
    pub fn from_config(config: &AiConfig, tracker: Arc<TokenTracker>) -> Result<Self> {
        let mut providers = BTreeMap::new();
        for name in [AZURE_OPENAI, HUGGINGFACE] {
            let provider = build_provider(name, config)?;
            providers.insert(
                name.to_string(),
                Arc::new(TrackedProvider::new(provider, tracker.clone())) as Arc<dyn AiProvider>,
            );
        }

        if !providers.contains_key(&config.default_provider) {
            anyhow::bail!("unknown AI provider: {}", config.default_provider);
        }

        Ok(Self {
            default: config.default_provider.clone(),
            providers,
        })
    }

    pub fn with_providers(
        default: impl Into<String>,
        providers: impl IntoIterator<Item = Arc<dyn AiProvider>>,
    ) -> Self {
        Self {
            default: default.into(),
            providers: providers
                .into_iter()
                .map(|p| (p.name().to_string(), p))
                .collect(),
        }
    }

    pub fn get(&self, name: Option<&str>) -> Option<Arc<dyn AiProvider>> {
        self.providers.get(name.unwrap_or(&self.default)).cloned()
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn available(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    pub fn configured(&self) -> Vec<&str> {
        self.providers
            .iter()
            .filter(|(_, p)| p.is_configured())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::{AppConfig, EnvSource};

    fn ai_config(pairs: &[(&str, &str)]) -> AiConfig {
        let overlay: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_source(&EnvSource::from_parts(HashMap::new(), overlay)).ai
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = ai_config(&[]);
        let err = build_provider("openrouter", &config).err().unwrap();
        assert!(err.to_string().contains("unknown AI provider"));
    }

    #[test]
    fn registry_resolves_default_and_named() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(TokenTracker::open(dir.path().join("usage.json")).unwrap());
        let config = ai_config(&[
            ("DEFAULT_AI_PROVIDER", "huggingface"),
            ("HUGGINGFACE_API_KEY", "hf_test"),
        ]);

        let registry = ProviderRegistry::from_config(&config, tracker).unwrap();
        assert_eq!(registry.get(None).unwrap().name(), HUGGINGFACE);
        assert_eq!(registry.get(Some(AZURE_OPENAI)).unwrap().name(), AZURE_OPENAI);
        assert!(registry.get(Some("nope")).is_none());
        assert_eq!(registry.configured(), vec![HUGGINGFACE]);
    }

    #[test]
    fn registry_rejects_unknown_default() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(TokenTracker::open(dir.path().join("usage.json")).unwrap());
        let config = ai_config(&[("DEFAULT_AI_PROVIDER", "mystery")]);
        assert!(ProviderRegistry::from_config(&config, tracker).is_err());
    }

    #[test]
    fn embedder_needs_endpoint_and_key() {
        assert!(build_embedder(&ai_config(&[])).is_none());
        assert!(build_embedder(&ai_config(&[
            ("AZURE_OPENAI_ENDPOINT", "acme.openai.azure.com"),
            ("AZURE_OPENAI_API_KEY", "k"),
        ]))
        .is_some());
    }
}
