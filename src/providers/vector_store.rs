//! Vector store capability: Qdrant-backed, in-memory mock, or not configured
//!
//! Every implementation normalizes results to the one canonical
//! [`RetrievedDocument`] shape on the way out; callers never special-case
//! storage internals.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{EngineError, EngineResult, ProviderKind};

/// What a retrievable schema document describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Table,
    Column,
    Relationship,
}

/// One retrievable schema description. Advisory context for prompt
/// grounding, never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub id: String,
    pub kind: DocumentKind,
    pub table_name: String,
    pub column_name: Option<String>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace documents by id
    async fn upsert(&self, collection: &str, documents: &[RetrievedDocument]) -> EngineResult<()>;

    /// Nearest documents to the query vector, highest score first
    async fn similarity_search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
    ) -> EngineResult<Vec<RetrievedDocument>>;

    async fn count_documents(&self, collection: &str) -> EngineResult<usize>;

    async fn delete_collection(&self, collection: &str) -> EngineResult<()>;

    async fn is_reachable(&self) -> bool {
        true
    }

    fn configured(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Not configured

pub struct NotConfiguredVectorStore {
    pub reason: String,
}

impl NotConfiguredVectorStore {
    fn error(&self) -> EngineError {
        EngineError::ProviderNotConfigured {
            capability: ProviderKind::VectorStore,
            reason: self.reason.clone(),
        }
    }
}

#[async_trait]
impl VectorStore for NotConfiguredVectorStore {
    async fn upsert(&self, _: &str, _: &[RetrievedDocument]) -> EngineResult<()> {
        Err(self.error())
    }

    async fn similarity_search(
        &self,
        _: &str,
        _: &[f32],
        _: usize,
    ) -> EngineResult<Vec<RetrievedDocument>> {
        Err(self.error())
    }

    async fn count_documents(&self, _: &str) -> EngineResult<usize> {
        Err(self.error())
    }

    async fn delete_collection(&self, _: &str) -> EngineResult<()> {
        Err(self.error())
    }

    async fn is_reachable(&self) -> bool {
        false
    }

    fn configured(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "not-configured"
    }
}

// ---------------------------------------------------------------------------
// Qdrant over REST

pub struct QdrantVectorStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl QdrantVectorStore {
    pub fn new(base_url: String, api_key: Option<String>, timeout: Duration) -> EngineResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.header("api-key", key);
        }
        builder
    }

    /// Qdrant point ids must be integers or UUIDs; document ids are hex
    /// digests, so the first 16 bytes become a deterministic UUID.
    fn point_id(document_id: &str) -> String {
        use sha2::{Digest, Sha256};
        let bytes = match hex::decode(document_id) {
            Ok(bytes) if bytes.len() >= 16 => bytes,
            _ => {
                let mut hasher = Sha256::new();
                hasher.update(document_id.as_bytes());
                hasher.finalize().to_vec()
            }
        };
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&bytes[..16]);
        uuid::Uuid::from_bytes(raw).to_string()
    }

    async fn ensure_collection(&self, collection: &str, dimension: usize) -> EngineResult<()> {
        let exists = self
            .request(reqwest::Method::GET, &format!("/collections/{collection}"))
            .send()
            .await?;
        if exists.status().is_success() {
            return Ok(());
        }
        let created = self
            .request(reqwest::Method::PUT, &format!("/collections/{collection}"))
            .json(&json!({ "vectors": { "size": dimension, "distance": "Cosine" } }))
            .send()
            .await?;
        if !created.status().is_success() {
            return Err(EngineError::Provider(format!(
                "failed to create collection '{collection}': HTTP {}",
                created.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn upsert(&self, collection: &str, documents: &[RetrievedDocument]) -> EngineResult<()> {
        let Some(dimension) = documents
            .iter()
            .find_map(|d| d.embedding.as_ref().map(|e| e.len()))
        else {
            return Ok(());
        };
        self.ensure_collection(collection, dimension).await?;

        let points: Vec<serde_json::Value> = documents
            .iter()
            .filter_map(|doc| {
                doc.embedding.as_ref().map(|embedding| {
                    json!({
                        "id": Self::point_id(&doc.id),
                        "vector": embedding,
                        "payload": {
                            "document_id": doc.id,
                            "kind": doc.kind,
                            "table_name": doc.table_name,
                            "column_name": doc.column_name,
                            "content": doc.content,
                        },
                    })
                })
            })
            .collect();

        let point_count = points.len();
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/collections/{collection}/points?wait=true"),
            )
            .json(&json!({ "points": points }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(EngineError::Provider(format!(
                "vector upsert failed: HTTP {}",
                response.status()
            )));
        }
        debug!(collection, points = point_count, "documents upserted");
        Ok(())
    }

    async fn similarity_search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
    ) -> EngineResult<Vec<RetrievedDocument>> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{collection}/points/search"),
            )
            .json(&json!({ "vector": query, "limit": limit, "with_payload": true }))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(EngineError::Provider(format!(
                "vector search failed: HTTP {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct SearchResponse {
            result: Vec<SearchHit>,
        }
        #[derive(Deserialize)]
        struct SearchHit {
            score: f32,
            payload: Payload,
        }
        #[derive(Deserialize)]
        struct Payload {
            document_id: Option<String>,
            kind: Option<DocumentKind>,
            table_name: Option<String>,
            column_name: Option<String>,
            content: Option<String>,
        }

        let body: SearchResponse = response.json().await?;
        Ok(body
            .result
            .into_iter()
            .map(|hit| RetrievedDocument {
                id: hit.payload.document_id.unwrap_or_default(),
                kind: hit.payload.kind.unwrap_or(DocumentKind::Table),
                table_name: hit.payload.table_name.unwrap_or_default(),
                column_name: hit.payload.column_name,
                content: hit.payload.content.unwrap_or_default(),
                embedding: None,
                score: Some(hit.score),
            })
            .collect())
    }

    async fn count_documents(&self, collection: &str) -> EngineResult<usize> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{collection}/points/count"),
            )
            .json(&json!({ "exact": true }))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(0);
        }
        if !response.status().is_success() {
            return Err(EngineError::Provider(format!(
                "document count failed: HTTP {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct CountResponse {
            result: CountResult,
        }
        #[derive(Deserialize)]
        struct CountResult {
            count: usize,
        }
        let body: CountResponse = response.json().await?;
        Ok(body.result.count)
    }

    async fn delete_collection(&self, collection: &str) -> EngineResult<()> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/collections/{collection}"),
            )
            .send()
            .await?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::Provider(format!(
                "collection delete failed: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn is_reachable(&self) -> bool {
        self.request(reqwest::Method::GET, "/collections")
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "qdrant"
    }
}

// ---------------------------------------------------------------------------
// In-memory mock

/// Deterministic in-memory store for tests: exact cosine ranking with a
/// stable tie-break, no network.
#[derive(Default)]
pub struct MockVectorStore {
    collections: RwLock<HashMap<String, HashMap<String, RetrievedDocument>>>,
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorStore for MockVectorStore {
    async fn upsert(&self, collection: &str, documents: &[RetrievedDocument]) -> EngineResult<()> {
        let mut collections = self.collections.write().unwrap();
        let entries = collections.entry(collection.to_string()).or_default();
        for doc in documents {
            entries.insert(doc.id.clone(), doc.clone());
        }
        Ok(())
    }

    async fn similarity_search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
    ) -> EngineResult<Vec<RetrievedDocument>> {
        let collections = self.collections.read().unwrap();
        let Some(entries) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<RetrievedDocument> = entries
            .values()
            .filter_map(|doc| {
                doc.embedding.as_ref().map(|embedding| {
                    let mut hit = doc.clone();
                    hit.score = Some(cosine_similarity(query, embedding));
                    hit.embedding = None;
                    hit
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn count_documents(&self, collection: &str) -> EngineResult<usize> {
        Ok(self
            .collections
            .read()
            .unwrap()
            .get(collection)
            .map(|entries| entries.len())
            .unwrap_or(0))
    }

    async fn delete_collection(&self, collection: &str) -> EngineResult<()> {
        self.collections.write().unwrap().remove(collection);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, table: &str, embedding: Vec<f32>) -> RetrievedDocument {
        RetrievedDocument {
            id: id.to_string(),
            kind: DocumentKind::Table,
            table_name: table.to_string(),
            column_name: None,
            content: format!("Table: {table}"),
            embedding: Some(embedding),
            score: None,
        }
    }

    #[tokio::test]
    async fn test_mock_search_ranks_by_cosine() {
        let store = MockVectorStore::default();
        store
            .upsert(
                "schema_ds1",
                &[
                    doc("a", "orders", vec![1.0, 0.0]),
                    doc("b", "customers", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        let hits = store
            .similarity_search("schema_ds1", &[1.0, 0.1], 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].table_name, "orders");
        assert!(hits[0].score.unwrap() > hits[1].score.unwrap());
        assert!(hits[0].embedding.is_none());
    }

    #[tokio::test]
    async fn test_mock_upsert_replaces_by_id() {
        let store = MockVectorStore::default();
        store
            .upsert("c", &[doc("a", "orders", vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .upsert("c", &[doc("a", "orders_v2", vec![1.0, 0.0])])
            .await
            .unwrap();

        assert_eq!(store.count_documents("c").await.unwrap(), 1);
        let hits = store.similarity_search("c", &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits[0].table_name, "orders_v2");
    }

    #[tokio::test]
    async fn test_mock_delete_collection() {
        let store = MockVectorStore::default();
        store
            .upsert("c", &[doc("a", "orders", vec![1.0])])
            .await
            .unwrap();
        store.delete_collection("c").await.unwrap();
        assert_eq!(store.count_documents("c").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_not_configured_fails_fast() {
        let store = NotConfiguredVectorStore {
            reason: "QDRANT_URL is not set".to_string(),
        };
        let err = store.count_documents("c").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::ProviderNotConfigured {
                capability: ProviderKind::VectorStore,
                ..
            }
        ));
        assert!(!store.is_reachable().await);
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_point_id_is_deterministic_uuid() {
        let digest = "a".repeat(64);
        let first = QdrantVectorStore::point_id(&digest);
        let second = QdrantVectorStore::point_id(&digest);
        assert_eq!(first, second);
        assert!(uuid::Uuid::parse_str(&first).is_ok());
    }
}
