//! Retrieval-augmented SQL generation
//!
//! Retrieve the closest schema documents, ground a prompt with them, invoke
//! the LLM, extract a single statement, and attach a deterministic
//! confidence score. Generation never surfaces a hard error: any failure
//! degrades to a clearly labeled low-confidence fallback so the orchestrator
//! always has something to run through the safety gate.

use std::collections::HashSet;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::ask::AskHistoryTurn;
use crate::indexer::collection_name;
use crate::providers::{GenerateOptions, ProviderSet, RetrievedDocument};
use crate::schema::SchemaDescriptor;

/// Fallback statement for degraded mode; the column alias labels it so the
/// output cannot be mistaken for a real answer.
pub const DEGRADED_FALLBACK_SQL: &str = "SELECT NULL AS degraded_mode LIMIT 1;";

/// Confidence assigned to the degraded fallback; must stay at or below 0.3
pub const DEGRADED_CONFIDENCE: f32 = 0.2;

#[derive(Debug, Clone)]
pub struct GeneratedSql {
    pub sql: String,
    pub explanation: String,
    /// Deterministic, explainable score in [0, 1]; never a model-reported
    /// probability
    pub confidence: f32,
    pub degraded: bool,
}

pub struct SqlGenerationPipeline {
    providers: ProviderSet,
    top_k: usize,
    history_turns: usize,
    timeout: Duration,
}

impl SqlGenerationPipeline {
    pub fn new(
        providers: ProviderSet,
        top_k: usize,
        history_turns: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            providers,
            top_k,
            history_turns,
            timeout,
        }
    }

    pub async fn generate(
        &self,
        question: &str,
        data_source_id: &str,
        schema: &SchemaDescriptor,
        history: &[AskHistoryTurn],
    ) -> GeneratedSql {
        let context = self.retrieve_context(question, data_source_id).await;
        let prompt = build_prompt(question, schema, &context, history, self.history_turns);

        let response = match tokio::time::timeout(
            self.timeout,
            self.providers
                .llm
                .generate(&prompt, &GenerateOptions::default()),
        )
        .await
        {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(error = %e, "LLM call failed, entering degraded mode");
                return degraded(format!("the language model was unavailable ({e})"));
            }
            Err(_) => {
                warn!("LLM call timed out, entering degraded mode");
                return degraded(format!(
                    "the language model did not answer within {}s",
                    self.timeout.as_secs()
                ));
            }
        };

        let Some(sql) = extract_sql(&response) else {
            warn!("LLM response contained no extractable SQL, entering degraded mode");
            return degraded("the language model returned no usable SQL".to_string());
        };

        let mut known_tables: HashSet<String> = schema
            .tables
            .iter()
            .map(|t| t.name.to_lowercase())
            .collect();
        known_tables.extend(context.iter().map(|d| d.table_name.to_lowercase()));

        let confidence = score_confidence(&sql, &known_tables);
        let explanation = extract_explanation(&response)
            .unwrap_or_else(|| format!("Generated from the question: \"{question}\""));

        debug!(confidence, "SQL generated");
        GeneratedSql {
            sql,
            explanation,
            confidence,
            degraded: false,
        }
    }

    /// Top-k schema documents for the question. Retrieval failures degrade
    /// to schema-only grounding, not to the fallback statement.
    async fn retrieve_context(
        &self,
        question: &str,
        data_source_id: &str,
    ) -> Vec<RetrievedDocument> {
        if !self.providers.embeddings.configured() || !self.providers.vector_store.configured() {
            debug!("retrieval providers not configured, grounding on schema only");
            return Vec::new();
        }

        let embed = tokio::time::timeout(self.timeout, self.providers.embeddings.embed(question));
        let query = match embed.await {
            Ok(Ok(vector)) => vector,
            Ok(Err(e)) => {
                warn!(error = %e, "query embedding failed, grounding on schema only");
                return Vec::new();
            }
            Err(_) => {
                warn!("query embedding timed out, grounding on schema only");
                return Vec::new();
            }
        };

        let collection = collection_name(data_source_id);
        let search = self.providers.vector_store.similarity_search(
            &collection,
            &query,
            self.top_k,
        );
        match tokio::time::timeout(self.timeout, search).await {
            Ok(Ok(documents)) => documents,
            Ok(Err(e)) => {
                warn!(error = %e, "similarity search failed, grounding on schema only");
                Vec::new()
            }
            Err(_) => {
                warn!("similarity search timed out, grounding on schema only");
                Vec::new()
            }
        }
    }
}

fn degraded(reason: String) -> GeneratedSql {
    GeneratedSql {
        sql: DEGRADED_FALLBACK_SQL.to_string(),
        explanation: format!(
            "Degraded mode: {reason}. This placeholder result carries no answer."
        ),
        confidence: DEGRADED_CONFIDENCE,
        degraded: true,
    }
}

pub(crate) fn build_prompt(
    question: &str,
    schema: &SchemaDescriptor,
    context: &[RetrievedDocument],
    history: &[AskHistoryTurn],
    history_turns: usize,
) -> String {
    let mut prompt = String::from("Given this database schema:\n");
    for table in &schema.tables {
        let columns: Vec<String> = table
            .columns
            .iter()
            .map(|c| {
                let mut rendered = format!("{} {}", c.name, c.data_type);
                if !c.nullable {
                    rendered.push_str(" not null");
                }
                if c.is_primary_key {
                    rendered.push_str(" primary key");
                }
                rendered
            })
            .collect();
        prompt.push_str(&format!(
            "Table {} (columns: {})\n",
            table.name,
            columns.join(", ")
        ));
    }

    prompt.push_str("\nRelevant context from the schema index:\n");
    if context.is_empty() {
        prompt.push_str("No indexed context available\n");
    } else {
        for document in context {
            prompt.push_str(&format!("- {}\n", document.content));
        }
    }

    let recent = history.iter().rev().take(history_turns).rev();
    let mut any_history = false;
    for turn in recent {
        if !any_history {
            prompt.push_str("\nConversation history:\n");
            any_history = true;
        }
        prompt.push_str(&format!("Q: {}\nSQL: {}\n", turn.question, turn.sql));
    }

    prompt.push_str(&format!(
        "\nGenerate a single SQL query for the following request: \"{question}\"\n\n\
         Requirements:\n\
         - Use only tables and columns that exist in the provided schema\n\
         - The query must be read-only (no INSERT, UPDATE, DELETE, DROP)\n\
         - Add a LIMIT clause unless the request implies a single row\n\
         - Return exactly one SQL statement terminated by a semicolon\n\n\
         Format your response as:\n\
         SQL: [your sql query here]\n\
         EXPLANATION: [brief explanation of what the query does]\n"
    ));
    prompt
}

/// Pull one SQL statement out of the model's raw response: the `SQL:`
/// section if present, then a fenced block, then a bare SELECT/WITH.
pub(crate) fn extract_sql(response: &str) -> Option<String> {
    let section = Regex::new(r"(?is)SQL:\s*(.*?)(?:\n\s*EXPLANATION:|\n\s*REASONING:|$)")
        .unwrap()
        .captures(response)
        .map(|caps| caps[1].to_string());

    let candidate = section
        .or_else(|| {
            Regex::new(r"(?is)```(?:sql)?\s*(.*?)```")
                .unwrap()
                .captures(response)
                .map(|caps| caps[1].to_string())
        })
        .or_else(|| {
            Regex::new(r"(?is)\b((?:SELECT|WITH)\b.*)")
                .unwrap()
                .captures(response)
                .map(|caps| caps[1].to_string())
        })?;

    let cleaned = clean_sql(&candidate);
    if cleaned == ";" || cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Strip code fences, collapse whitespace, enforce the terminal semicolon
fn clean_sql(sql: &str) -> String {
    let without_fences = Regex::new(r"(?i)```(?:sql)?")
        .unwrap()
        .replace_all(sql, "");
    let collapsed = without_fences
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let trimmed = collapsed.trim_end_matches(';').trim_end();
    if trimmed.is_empty() {
        ";".to_string()
    } else {
        format!("{trimmed};")
    }
}

pub(crate) fn extract_explanation(response: &str) -> Option<String> {
    Regex::new(r"(?is)EXPLANATION:\s*(.*?)(?:\n\s*REASONING:|$)")
        .unwrap()
        .captures(response)
        .map(|caps| caps[1].trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Deterministic confidence in [0, 1] from observable statement properties
pub(crate) fn score_confidence(sql: &str, known_tables: &HashSet<String>) -> f32 {
    let mut confidence = 0.0f32;

    let referenced = crate::cache::referenced_tables(sql);
    if !referenced.is_empty() && referenced.iter().all(|t| known_tables.contains(t)) {
        confidence += 0.3;
    }
    if balanced_parentheses(sql) {
        confidence += 0.2;
    }
    if Regex::new(r"(?i)\bfrom\b").unwrap().is_match(sql) {
        confidence += 0.2;
    }
    let placeholders = ["{", "}", "<table", "<column", "your_table", "table_name"];
    if !placeholders
        .iter()
        .any(|p| sql.to_lowercase().contains(p))
    {
        confidence += 0.2;
    }
    if Regex::new(r"(?i)\b(limit|top)\b").unwrap().is_match(sql) {
        confidence += 0.1;
    }
    confidence.clamp(0.0, 1.0)
}

fn balanced_parentheses(sql: &str) -> bool {
    let mut depth: i32 = 0;
    for c in sql.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}
