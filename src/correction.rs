//! LLM-backed repair of a failed SQL statement
//!
//! Given the statement and the literal database error, classify the failure,
//! retrieve schema context the same way generation does, ask for a single
//! corrected statement, and re-validate it through the safety gate before
//! handing it back. The orchestrator invokes this at most once per Ask.

use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::dialect::DialectAdapter;
use crate::error::{EngineError, EngineResult};
use crate::generation::extract_explanation;
use crate::indexer::collection_name;
use crate::providers::{GenerateOptions, ProviderSet, RetrievedDocument};
use crate::safety;
use crate::schema::SchemaDescriptor;

const CORRECTION_RULES: &str = "\
1. Use proper ANSI SQL syntax\n\
2. Ensure all referenced tables and columns exist in the schema\n\
3. Use correct JOIN syntax (JOIN ... ON ...)\n\
4. Keep parentheses balanced\n\
5. Use a GROUP BY clause when aggregate functions are mixed with plain columns\n\
6. Preserve the intent of the original query\n\
7. Keep the query read-only and keep a LIMIT clause\n";

#[derive(Debug, Clone)]
pub struct CorrectedSql {
    pub sql: String,
    pub confidence: f32,
    pub explanation: String,
}

pub struct SqlCorrectionPipeline {
    providers: ProviderSet,
    top_k: usize,
    timeout: Duration,
}

impl SqlCorrectionPipeline {
    pub fn new(providers: ProviderSet, top_k: usize, timeout: Duration) -> Self {
        Self {
            providers,
            top_k,
            timeout,
        }
    }

    pub async fn correct(
        &self,
        original_sql: &str,
        execution_error: &str,
        data_source_id: &str,
        schema: &SchemaDescriptor,
        adapter: &'static dyn DialectAdapter,
        row_limit: u32,
    ) -> EngineResult<CorrectedSql> {
        let error_type = classify_error(execution_error);
        debug!(error_type, "attempting SQL correction");

        let context = self.retrieve_context(original_sql, execution_error, data_source_id).await;
        let prompt = build_correction_prompt(
            original_sql,
            execution_error,
            error_type,
            schema,
            &context,
        );

        let response = tokio::time::timeout(
            self.timeout,
            self.providers
                .llm
                .generate(&prompt, &GenerateOptions::default()),
        )
        .await
        .map_err(|_| EngineError::Timeout {
            seconds: self.timeout.as_secs(),
        })??;

        let corrected = extract_corrected_sql(&response).ok_or_else(|| {
            EngineError::Provider("could not extract corrected SQL from response".to_string())
        })?;

        // The repaired statement goes back through the gate; an unsafe
        // correction fails the Ask rather than executing.
        let safe = safety::validate(&corrected, adapter, row_limit)?;

        let confidence = score_correction(original_sql, &safe.sql);
        let explanation = extract_explanation(&response)
            .unwrap_or_else(|| "The statement was revised to address the reported error.".to_string());

        Ok(CorrectedSql {
            sql: safe.sql,
            confidence,
            explanation,
        })
    }

    async fn retrieve_context(
        &self,
        original_sql: &str,
        execution_error: &str,
        data_source_id: &str,
    ) -> Vec<RetrievedDocument> {
        if !self.providers.embeddings.configured() || !self.providers.vector_store.configured() {
            return Vec::new();
        }
        let query_text = format!("SQL error: {execution_error} {original_sql}");
        let query = match tokio::time::timeout(
            self.timeout,
            self.providers.embeddings.embed(&query_text),
        )
        .await
        {
            Ok(Ok(vector)) => vector,
            _ => {
                warn!("embedding for correction context unavailable");
                return Vec::new();
            }
        };
        match tokio::time::timeout(
            self.timeout,
            self.providers.vector_store.similarity_search(
                &collection_name(data_source_id),
                &query,
                self.top_k,
            ),
        )
        .await
        {
            Ok(Ok(documents)) => documents,
            _ => {
                warn!("similarity search for correction context unavailable");
                Vec::new()
            }
        }
    }
}

/// Bucket a database error message by its likely root cause
pub(crate) fn classify_error(error: &str) -> &'static str {
    let lowered = error.to_lowercase();
    let buckets: [(&str, &[&str]); 7] = [
        ("table_not_found", &["no such table", "unknown table", "relation"]),
        ("column_not_found", &["no such column", "unknown column", "column"]),
        ("missing_group_by", &["group by", "aggregate"]),
        ("unbalanced_parentheses", &["parenthes", "bracket"]),
        ("join_error", &["join", "ambiguous"]),
        ("data_type_error", &["type", "conversion", "cast"]),
        ("syntax_error", &["syntax", "unexpected token", "near"]),
    ];
    for (bucket, patterns) in buckets {
        if patterns.iter().any(|p| lowered.contains(p)) {
            return bucket;
        }
    }
    "unknown"
}

fn build_correction_prompt(
    original_sql: &str,
    execution_error: &str,
    error_type: &str,
    schema: &SchemaDescriptor,
    context: &[RetrievedDocument],
) -> String {
    let mut schema_block = String::new();
    for table in &schema.tables {
        let columns: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.data_type))
            .collect();
        schema_block.push_str(&format!(
            "Table {} (columns: {})\n",
            table.name,
            columns.join(", ")
        ));
    }

    let context_block = if context.is_empty() {
        "No indexed context available\n".to_string()
    } else {
        context
            .iter()
            .map(|d| format!("- {}\n", d.content))
            .collect()
    };

    format!(
        "You are an expert SQL debugger. Fix the SQL query below.\n\n\
         ### ERROR TYPE ###\n{error_type}\n\n\
         ### ORIGINAL SQL ###\n{original_sql}\n\n\
         ### ERROR MESSAGE ###\n{execution_error}\n\n\
         ### DATABASE SCHEMA ###\n{schema_block}\n\
         ### RELEVANT CONTEXT ###\n{context_block}\n\
         ### RULES ###\n{CORRECTION_RULES}\n\
         Respond as:\n\
         CORRECTED_SQL: [your corrected query]\n\
         EXPLANATION: [what was wrong and how you fixed it]\n"
    )
}

fn extract_corrected_sql(response: &str) -> Option<String> {
    let section = Regex::new(r"(?is)CORRECTED_SQL:\s*(.*?)(?:\n\s*EXPLANATION:|$)")
        .unwrap()
        .captures(response)
        .map(|caps| caps[1].to_string());
    match section {
        Some(candidate) => {
            let cleaned = candidate.split_whitespace().collect::<Vec<_>>().join(" ");
            let trimmed = cleaned.trim_end_matches(';').trim_end();
            if trimmed.is_empty() {
                None
            } else {
                Some(format!("{trimmed};"))
            }
        }
        None => crate::generation::extract_sql(response),
    }
}

/// Deterministic confidence for a correction: changed statements score
/// higher than verbatim echoes
fn score_correction(original_sql: &str, corrected_sql: &str) -> f32 {
    let mut confidence = 0.3f32;
    if crate::cache::normalize_sql(original_sql) != crate::cache::normalize_sql(corrected_sql) {
        confidence += 0.2;
    }
    if Regex::new(r"(?i)\bfrom\b").unwrap().is_match(corrected_sql) {
        confidence += 0.1;
    }
    if Regex::new(r"(?i)\blimit\b").unwrap().is_match(corrected_sql) {
        confidence += 0.1;
    }
    confidence.clamp(0.0, 1.0)
}
