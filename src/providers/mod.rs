//! Pluggable AI capabilities: LLM, embeddings, and vector store
//!
//! Each capability has three implementations behind one trait: a real,
//! network-backed provider; a deterministic mock for tests; and a
//! NotConfigured variant that fails fast with a typed error. Selection
//! happens once at startup through [`ProviderSet::resolve`] — production
//! paths resolve to Real or NotConfigured, never to a mock.

pub mod embeddings;
pub mod llm;
pub mod vector_store;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::config::ProvidersConfig;

pub use embeddings::{EmbeddingsProvider, MockEmbeddings, NotConfiguredEmbeddings, OpenAiEmbeddings};
pub use llm::{AnthropicLlm, GenerateOptions, LlmProvider, MockLlm, NotConfiguredLlm};
pub use vector_store::{
    DocumentKind, MockVectorStore, NotConfiguredVectorStore, QdrantVectorStore, RetrievedDocument,
    VectorStore,
};

/// Which variant is active per capability, and whether the vector store
/// answered its liveness probe
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub llm_configured: bool,
    pub embeddings_configured: bool,
    pub vector_store_configured: bool,
    pub vector_store_reachable: bool,
    pub llm_variant: &'static str,
    pub embeddings_variant: &'static str,
    pub vector_store_variant: &'static str,
}

/// The resolved capability set handed to the pipelines
#[derive(Clone)]
pub struct ProviderSet {
    pub llm: Arc<dyn LlmProvider>,
    pub embeddings: Arc<dyn EmbeddingsProvider>,
    pub vector_store: Arc<dyn VectorStore>,
}

impl ProviderSet {
    /// Resolve providers from configuration, once, at startup.
    ///
    /// A capability with credentials present becomes Real; anything else
    /// becomes NotConfigured. A configured vector store that fails its
    /// liveness probe is downgraded to NotConfigured so the failure surfaces
    /// as a clear typed error instead of per-call network noise.
    pub async fn resolve(config: &ProvidersConfig, timeout: Duration) -> Self {
        let llm: Arc<dyn LlmProvider> = match config.llm.resolved_api_key() {
            Some(api_key) => match AnthropicLlm::new(
                api_key,
                config.llm.base_url.clone(),
                config.llm.model.clone(),
                timeout,
            ) {
                Ok(provider) => Arc::new(provider),
                Err(e) => Arc::new(NotConfiguredLlm {
                    reason: format!("client construction failed: {e}"),
                }),
            },
            None => Arc::new(NotConfiguredLlm {
                reason: "no API key in configuration or ANTHROPIC_API_KEY".to_string(),
            }),
        };

        let embeddings: Arc<dyn EmbeddingsProvider> = match config.embeddings.resolved_api_key() {
            Some(api_key) => match OpenAiEmbeddings::new(
                api_key,
                config.embeddings.base_url.clone(),
                config.embeddings.model.clone(),
                config.embeddings.dimension,
                timeout,
            ) {
                Ok(provider) => Arc::new(provider),
                Err(e) => Arc::new(NotConfiguredEmbeddings {
                    reason: format!("client construction failed: {e}"),
                }),
            },
            None => Arc::new(NotConfiguredEmbeddings {
                reason: "no API key in configuration or OPENAI_API_KEY".to_string(),
            }),
        };

        let vector_store: Arc<dyn VectorStore> = match config.vector_store.resolved_url() {
            Some(url) => {
                match QdrantVectorStore::new(url, config.vector_store.resolved_api_key(), timeout)
                {
                    Ok(store) => {
                        if store.is_reachable().await {
                            Arc::new(store)
                        } else {
                            Arc::new(NotConfiguredVectorStore {
                                reason: "vector store did not answer its liveness probe"
                                    .to_string(),
                            })
                        }
                    }
                    Err(e) => Arc::new(NotConfiguredVectorStore {
                        reason: format!("client construction failed: {e}"),
                    }),
                }
            }
            None => Arc::new(NotConfiguredVectorStore {
                reason: "no URL in configuration or QDRANT_URL".to_string(),
            }),
        };

        info!(
            llm = llm.name(),
            embeddings = embeddings.name(),
            vector_store = vector_store.name(),
            "providers resolved"
        );

        Self {
            llm,
            embeddings,
            vector_store,
        }
    }

    /// Fully mocked set. Test harnesses only; [`ProviderSet::resolve`] never
    /// selects these variants.
    pub fn mock() -> Self {
        Self {
            llm: Arc::new(MockLlm::default()),
            embeddings: Arc::new(MockEmbeddings::default()),
            vector_store: Arc::new(MockVectorStore::default()),
        }
    }

    pub async fn health(&self) -> ProviderHealth {
        ProviderHealth {
            llm_configured: self.llm.configured(),
            embeddings_configured: self.embeddings.configured(),
            vector_store_configured: self.vector_store.configured(),
            vector_store_reachable: self.vector_store.is_reachable().await,
            llm_variant: self.llm.name(),
            embeddings_variant: self.embeddings.name(),
            vector_store_variant: self.vector_store.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvidersConfig;

    #[tokio::test]
    async fn test_resolve_without_credentials_yields_not_configured() {
        // An empty config (and no env overrides expected in CI for these
        // names) must resolve to fail-fast variants, never to mocks.
        let config = ProvidersConfig::default();
        if config.llm.resolved_api_key().is_some()
            || config.embeddings.resolved_api_key().is_some()
            || config.vector_store.resolved_url().is_some()
        {
            return; // environment provides real credentials; skip
        }

        let set = ProviderSet::resolve(&config, Duration::from_secs(5)).await;
        let health = set.health().await;
        assert!(!health.llm_configured);
        assert!(!health.embeddings_configured);
        assert!(!health.vector_store_configured);
        assert!(!health.vector_store_reachable);
        assert_eq!(health.llm_variant, "not-configured");
        assert_ne!(health.llm_variant, "mock");
    }

    #[tokio::test]
    async fn test_mock_set_reports_healthy_variants() {
        let health = ProviderSet::mock().health().await;
        assert!(health.llm_configured);
        assert!(health.embeddings_configured);
        assert!(health.vector_store_reachable);
        assert_eq!(health.llm_variant, "mock");
    }
}
