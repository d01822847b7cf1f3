//! Schema indexer: turn a schema snapshot into retrievable documents
//!
//! One document per table, one per column, plus relationship documents
//! inferred from `<singular>_id` column naming. Document ids are
//! deterministic digests of (data source, kind, table, column) so
//! re-indexing replaces rather than duplicates. Indexing without embeddings
//! is a hard failure, not a degraded mode.

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{EngineError, EngineResult, ProviderKind};
use crate::providers::{DocumentKind, ProviderSet, RetrievedDocument};
use crate::schema::{SchemaDescriptor, TableDescriptor};

/// Collection naming shared by indexing and retrieval
pub fn collection_name(data_source_id: &str) -> String {
    format!("schema_{data_source_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexingReport {
    pub tables_indexed: usize,
    pub columns_indexed: usize,
    pub relationships_indexed: usize,
    pub total_documents: usize,
}

pub struct SchemaIndexer {
    providers: ProviderSet,
}

impl SchemaIndexer {
    pub fn new(providers: ProviderSet) -> Self {
        Self { providers }
    }

    pub async fn index_schema(
        &self,
        data_source_id: &str,
        schema: &SchemaDescriptor,
    ) -> EngineResult<IndexingReport> {
        if !self.providers.embeddings.configured() {
            return Err(EngineError::ProviderNotConfigured {
                capability: ProviderKind::Embeddings,
                reason: "schema indexing requires an embeddings provider".to_string(),
            });
        }

        let mut documents = Vec::new();
        let mut tables_indexed = 0usize;
        let mut columns_indexed = 0usize;

        for table in &schema.tables {
            documents.push(table_document(data_source_id, table));
            tables_indexed += 1;
            for column in &table.columns {
                documents.push(column_document(data_source_id, &table.name, column));
                columns_indexed += 1;
            }
        }

        let relationship_docs = relationship_documents(data_source_id, schema);
        let relationships_indexed = relationship_docs.len();
        documents.extend(relationship_docs);

        let contents: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let embeddings = self.providers.embeddings.embed_batch(&contents).await?;
        for (document, embedding) in documents.iter_mut().zip(embeddings) {
            document.embedding = Some(embedding);
        }

        let collection = collection_name(data_source_id);
        self.providers
            .vector_store
            .upsert(&collection, &documents)
            .await?;

        let report = IndexingReport {
            tables_indexed,
            columns_indexed,
            relationships_indexed,
            total_documents: documents.len(),
        };
        info!(
            data_source = data_source_id,
            documents = report.total_documents,
            "schema indexed"
        );
        Ok(report)
    }
}

fn document_id(data_source_id: &str, kind: DocumentKind, table: &str, column: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data_source_id.as_bytes());
    hasher.update([0]);
    hasher.update(kind.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(table.as_bytes());
    hasher.update([0]);
    hasher.update(column.as_bytes());
    hex::encode(hasher.finalize())
}

fn table_document(data_source_id: &str, table: &TableDescriptor) -> RetrievedDocument {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| format!("{} ({})", c.name, c.data_type))
        .collect();
    RetrievedDocument {
        id: document_id(data_source_id, DocumentKind::Table, &table.name, ""),
        kind: DocumentKind::Table,
        table_name: table.name.clone(),
        column_name: None,
        content: format!("Table: {}. Columns: {}", table.name, columns.join(", ")),
        embedding: None,
        score: None,
    }
}

fn column_document(
    data_source_id: &str,
    table_name: &str,
    column: &crate::schema::ColumnDescriptor,
) -> RetrievedDocument {
    let nullability = if column.nullable {
        "nullable"
    } else {
        "not null"
    };
    RetrievedDocument {
        id: document_id(data_source_id, DocumentKind::Column, table_name, &column.name),
        kind: DocumentKind::Column,
        table_name: table_name.to_string(),
        column_name: Some(column.name.clone()),
        content: format!(
            "Column {} in table {}. Type: {}, {nullability}",
            column.name, table_name, column.data_type
        ),
        embedding: None,
        score: None,
    }
}

/// Infer foreign-key relationships from `<singular>_id` column naming; the
/// normalized schema shape carries no constraint metadata.
fn relationship_documents(
    data_source_id: &str,
    schema: &SchemaDescriptor,
) -> Vec<RetrievedDocument> {
    let mut documents = Vec::new();
    for table in &schema.tables {
        for column in &table.columns {
            let Some(stem) = column.name.strip_suffix("_id") else {
                continue;
            };
            let target = [format!("{stem}s"), format!("{stem}es"), stem.to_string()]
                .into_iter()
                .find(|candidate| {
                    candidate != &table.name && schema.table(candidate).is_some()
                });
            if let Some(target) = target {
                documents.push(RetrievedDocument {
                    id: document_id(
                        data_source_id,
                        DocumentKind::Relationship,
                        &table.name,
                        &column.name,
                    ),
                    kind: DocumentKind::Relationship,
                    table_name: table.name.clone(),
                    column_name: Some(column.name.clone()),
                    content: format!(
                        "Foreign key relationship: {}.{} -> {}.id",
                        table.name, column.name, target
                    ),
                    embedding: None,
                    score: None,
                });
            }
        }
    }
    documents
}
