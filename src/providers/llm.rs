//! LLM capability: Anthropic-backed, deterministic mock, or not configured

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, EngineResult, ProviderKind};

const SYSTEM_PROMPT: &str = "You are a helpful SQL generation assistant. \
    Respond in the exact format the prompt requests and output only one SQL statement.";

/// Generation parameters; low temperature keeps SQL output stable
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            temperature: 0.1,
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> EngineResult<String>;

    fn configured(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Not configured

pub struct NotConfiguredLlm {
    pub reason: String,
}

#[async_trait]
impl LlmProvider for NotConfiguredLlm {
    async fn generate(&self, _: &str, _: &GenerateOptions) -> EngineResult<String> {
        Err(EngineError::ProviderNotConfigured {
            capability: ProviderKind::Llm,
            reason: self.reason.clone(),
        })
    }

    fn configured(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "not-configured"
    }
}

// ---------------------------------------------------------------------------
// Anthropic messages API

pub struct AnthropicLlm {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl AnthropicLlm {
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        timeout: Duration,
    ) -> EngineResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    text: String,
}

#[async_trait]
impl LlmProvider for AnthropicLlm {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> EngineResult<String> {
        let request = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            system: SYSTEM_PROMPT.to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        debug!(model = %self.model, prompt_len = prompt.len(), "calling LLM");

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Provider(format!(
                "LLM request failed: HTTP {status}: {body}"
            )));
        }

        let body: AnthropicResponse = response.json().await?;
        body.content
            .first()
            .map(|block| block.text.clone())
            .ok_or_else(|| EngineError::Provider("no content in LLM response".to_string()))
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

// ---------------------------------------------------------------------------
// Deterministic mock

/// Canned, prompt-pattern-matched SQL with no network.
///
/// Responses can also be scripted for tests: queued responses are returned
/// in order before the heuristics kick in.
#[derive(Default)]
pub struct MockLlm {
    scripted: Mutex<VecDeque<String>>,
    delay: Duration,
}

impl MockLlm {
    pub fn with_responses(responses: Vec<&str>) -> Self {
        Self {
            scripted: Mutex::new(responses.into_iter().map(|s| s.to_string()).collect()),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            delay,
        }
    }

    fn tables_in_prompt(prompt: &str) -> Vec<(String, Vec<String>)> {
        let re = Regex::new(r"Table (\w+) \(columns: ([^)]+)\)").unwrap();
        let mut tables = Vec::new();
        for caps in re.captures_iter(prompt) {
            let name = caps[1].to_string();
            let columns: Vec<String> = caps[2]
                .split(',')
                .filter_map(|entry| entry.split_whitespace().next())
                .map(|c| c.to_string())
                .collect();
            if !tables.iter().any(|(n, _)| *n == name) {
                tables.push((name, columns));
            }
        }
        tables
    }

    fn relationship_in_prompt(prompt: &str) -> Option<(String, String, String)> {
        let re = Regex::new(r"(\w+)\.(\w+) -> (\w+)\.\w+").unwrap();
        re.captures(prompt)
            .map(|caps| (caps[1].to_string(), caps[2].to_string(), caps[3].to_string()))
    }

    fn aggregation_answer(prompt: &str, limit: u32) -> Option<String> {
        let tables = Self::tables_in_prompt(prompt);
        let (child, fk, parent) = Self::relationship_in_prompt(prompt)?;
        let parent_columns = tables.iter().find(|(n, _)| *n == parent)?.1.clone();
        let child_columns = tables.iter().find(|(n, _)| *n == child)?.1.clone();

        let label = if parent_columns.iter().any(|c| c == "name") {
            "name".to_string()
        } else {
            parent_columns.first()?.clone()
        };
        let measures = ["amount", "revenue", "total", "price", "quantity", "value"];
        let aggregate = child_columns
            .iter()
            .find(|c| measures.contains(&c.as_str()))
            .map(|m| format!("SUM({child}.{m})"))
            .unwrap_or_else(|| format!("COUNT({child}.id)"));

        Some(format!(
            "SELECT {parent}.{label}, {aggregate} AS total FROM {parent} \
             JOIN {child} ON {child}.{fk} = {parent}.id \
             GROUP BY {parent}.{label} ORDER BY total DESC LIMIT {limit}"
        ))
    }

    fn heuristic_response(prompt: &str) -> String {
        let question = Regex::new(r#"(?s)request: "([^"]*)""#)
            .unwrap()
            .captures(prompt)
            .map(|caps| caps[1].to_string())
            .unwrap_or_default();

        if prompt.contains("### ORIGINAL SQL ###") {
            // Correction prompt: fall back to a broad read of the first table
            let tables = Self::tables_in_prompt(prompt);
            let table = tables
                .first()
                .map(|(n, _)| n.clone())
                .unwrap_or_else(|| "information_schema_tables".to_string());
            return format!(
                "CORRECTED_SQL: SELECT * FROM {table} LIMIT 100;\n\
                 EXPLANATION: Replaced the failing statement with a valid read of {table}."
            );
        }

        let top_n = Regex::new(r"(?i)\btop\s+(\d+)")
            .unwrap()
            .captures(&question)
            .and_then(|caps| caps[1].parse::<u32>().ok());

        if let Some(limit) = top_n {
            if let Some(sql) = Self::aggregation_answer(prompt, limit) {
                return format!(
                    "SQL: {sql};\nEXPLANATION: Aggregated and ranked rows across the joined tables."
                );
            }
        }

        let tables = Self::tables_in_prompt(prompt);
        let question_lower = question.to_lowercase();
        let table = tables
            .iter()
            .find(|(name, _)| question_lower.contains(&name.to_lowercase()))
            .or_else(|| tables.first())
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| "orders".to_string());

        format!("SQL: SELECT * FROM {table} LIMIT 100;\nEXPLANATION: Broad read of {table}.")
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    async fn generate(&self, prompt: &str, _options: &GenerateOptions) -> EngineResult<String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(scripted) = self.scripted.lock().unwrap().pop_front() {
            return Ok(scripted);
        }
        Ok(Self::heuristic_response(prompt))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
