//! Engine configuration
//!
//! All knobs have working defaults; provider credentials fall back to
//! environment variables so deployments can keep secrets out of files.

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Configuration for the query engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Row limit injected into accepted statements
    pub row_limit: u32,

    /// Timeout for executing a user query
    pub execution_timeout_secs: u64,

    /// Timeout for creating a connection pool
    pub connect_timeout_secs: u64,

    /// Timeout for LLM / embeddings / vector store calls
    pub provider_timeout_secs: u64,

    /// How long a schema snapshot stays fresh
    pub schema_cache_ttl_secs: u64,

    /// Number of schema documents retrieved to ground a prompt
    pub retrieval_top_k: usize,

    /// Most recent conversation turns included in the prompt
    pub history_turns: usize,

    /// Result caching on/off
    pub cache_enabled: bool,

    pub providers: ProvidersConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            row_limit: 1000,
            execution_timeout_secs: 30,
            connect_timeout_secs: 30,
            provider_timeout_secs: 30,
            schema_cache_ttl_secs: 300,
            retrieval_top_k: 8,
            history_turns: 4,
            cache_enabled: true,
            providers: ProvidersConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> EngineResult<Self> {
        toml::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| EngineError::Config(format!("cannot read config file: {e}")))?;
        Self::from_toml_str(&raw)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn schema_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.schema_cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub llm: LlmConfig,
    pub embeddings: EmbeddingsConfig,
    pub vector_store: VectorStoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// API key; falls back to ANTHROPIC_API_KEY
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "claude-3-5-haiku-latest".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
        }
    }
}

impl LlmConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| env::var("ANTHROPIC_API_KEY").ok())
            .filter(|key| !key.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    /// API key; falls back to OPENAI_API_KEY
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub dimension: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "text-embedding-3-small".to_string(),
            base_url: "https://api.openai.com".to_string(),
            dimension: 1536,
        }
    }
}

impl EmbeddingsConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| env::var("OPENAI_API_KEY").ok())
            .filter(|key| !key.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    /// Store URL; falls back to QDRANT_URL
    pub url: Option<String>,
    /// API key; falls back to QDRANT_API_KEY
    pub api_key: Option<String>,
}

impl VectorStoreConfig {
    pub fn resolved_url(&self) -> Option<String> {
        self.url
            .clone()
            .or_else(|| env::var("QDRANT_URL").ok())
            .filter(|url| !url.is_empty())
    }

    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| env::var("QDRANT_API_KEY").ok())
            .filter(|key| !key.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.row_limit, 1000);
        assert_eq!(config.execution_timeout_secs, 30);
        assert_eq!(config.retrieval_top_k, 8);
        assert!(config.cache_enabled);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            row_limit = 250

            [providers.llm]
            model = "claude-test"
            "#,
        )
        .unwrap();
        assert_eq!(config.row_limit, 250);
        assert_eq!(config.execution_timeout_secs, 30);
        assert_eq!(config.providers.llm.model, "claude-test");
        assert_eq!(
            config.providers.embeddings.model,
            "text-embedding-3-small"
        );
    }

    #[rstest]
    #[case("not valid toml [")]
    #[case("row_limit = \"many\"")]
    fn test_invalid_toml_is_a_config_error(#[case] raw: &str) {
        assert!(matches!(
            EngineConfig::from_toml_str(raw),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_explicit_api_key_wins_over_env() {
        let config = LlmConfig {
            api_key: Some("from-file".to_string()),
            ..LlmConfig::default()
        };
        assert_eq!(config.resolved_api_key().unwrap(), "from-file");
    }
}
