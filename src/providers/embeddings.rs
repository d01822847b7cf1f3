//! Embeddings capability: OpenAI-backed, deterministic mock, or not configured

use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{EngineError, EngineResult, ProviderKind};

/// OpenAI caps embedding batch sizes; larger inputs are chunked
const BATCH_SIZE: usize = 100;

#[async_trait]
pub trait EmbeddingsProvider: Send + Sync {
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;

    fn configured(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Not configured

pub struct NotConfiguredEmbeddings {
    pub reason: String,
}

impl NotConfiguredEmbeddings {
    fn error(&self) -> EngineError {
        EngineError::ProviderNotConfigured {
            capability: ProviderKind::Embeddings,
            reason: self.reason.clone(),
        }
    }
}

#[async_trait]
impl EmbeddingsProvider for NotConfiguredEmbeddings {
    async fn embed(&self, _: &str) -> EngineResult<Vec<f32>> {
        Err(self.error())
    }

    async fn embed_batch(&self, _: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        Err(self.error())
    }

    fn dimension(&self) -> usize {
        0
    }

    fn configured(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "not-configured"
    }
}

// ---------------------------------------------------------------------------
// OpenAI

pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dimension: usize,
}

impl OpenAiEmbeddings {
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        dimension: usize,
        timeout: Duration,
    ) -> EngineResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dimension,
        })
    }

    async fn request_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        #[derive(Serialize)]
        struct EmbeddingsRequest<'a> {
            model: &'a str,
            input: &'a [String],
        }
        #[derive(Deserialize)]
        struct EmbeddingsResponse {
            data: Vec<EmbeddingData>,
        }
        #[derive(Deserialize)]
        struct EmbeddingData {
            embedding: Vec<f32>,
        }

        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&EmbeddingsRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Provider(format!(
                "embeddings request failed: HTTP {status}: {body}"
            )));
        }

        let body: EmbeddingsResponse = response.json().await?;
        if body.data.len() != texts.len() {
            return Err(EngineError::Provider(format!(
                "embeddings response had {} vectors for {} inputs",
                body.data.len(),
                texts.len()
            )));
        }
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingsProvider for OpenAiEmbeddings {
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let mut vectors = self.request_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EngineError::Provider("empty embeddings response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(BATCH_SIZE) {
            all.extend(self.request_batch(chunk).await?);
        }
        debug!(count = texts.len(), "embeddings generated");
        Ok(all)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

// ---------------------------------------------------------------------------
// Deterministic mock

/// Hash-seeded vectors: the same text always embeds to the same vector, and
/// different texts land in different directions. No network.
pub struct MockEmbeddings {
    dimension: usize,
}

impl Default for MockEmbeddings {
    fn default() -> Self {
        Self { dimension: 64 }
    }
}

impl MockEmbeddings {
    pub fn with_dimension(dimension: usize) -> Self {
        Self { dimension }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        let seed = u64::from_be_bytes(digest[..8].try_into().unwrap());

        let mut rng = StdRng::seed_from_u64(seed);
        let mut vector: Vec<f32> = (0..self.dimension)
            .map(|_| rng.random_range(-1.0f32..1.0f32))
            .collect();
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingsProvider for MockEmbeddings {
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
