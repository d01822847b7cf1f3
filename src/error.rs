//! Error types for the query engine

use thiserror::Error;

use crate::datasource::DialectKind;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Provider capability, used to report which capability is missing
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, serde::Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Llm,
    Embeddings,
    VectorStore,
}

/// Errors that can occur while answering a question against a data source
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("connection to data source '{data_source_id}' ({dialect}) failed: {cause}")]
    Connection {
        data_source_id: String,
        dialect: DialectKind,
        cause: String,
    },

    #[error("{dialect} does not support {operation}")]
    UnsupportedDialectOperation {
        dialect: DialectKind,
        operation: String,
    },

    #[error("unsafe SQL rejected: {0}")]
    UnsafeSqlRejected(String),

    #[error("query execution failed: {cause}")]
    Execution { cause: String },

    #[error("{capability} provider is not configured: {reason}")]
    ProviderNotConfigured {
        capability: ProviderKind,
        reason: String,
    },

    #[error("schema introspection failed: {0}")]
    Schema(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("unknown data source: {0}")]
    UnknownDataSource(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EngineError {
    /// Get user-friendly error message suitable for an Ask's terminal error field
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Connection {
                data_source_id,
                dialect,
                cause,
            } => format!(
                "Could not connect to data source '{data_source_id}' ({dialect}): {cause}"
            ),
            EngineError::UnsupportedDialectOperation { dialect, operation } => {
                format!("{dialect} does not support {operation}")
            }
            EngineError::UnsafeSqlRejected(reason) => {
                format!("The generated SQL was rejected as unsafe: {reason}")
            }
            EngineError::Execution { cause } => format!("The database rejected the query: {cause}"),
            EngineError::ProviderNotConfigured { capability, reason } => {
                format!("The {capability} provider is not configured: {reason}")
            }
            EngineError::Timeout { seconds } => {
                format!("The operation timed out after {seconds} seconds")
            }
            EngineError::UnknownDataSource(id) => format!("No data source registered as '{id}'"),
            _ => self.to_string(),
        }
    }

    /// Check if the error came from the database at runtime and is therefore
    /// eligible for a correction attempt
    pub fn is_correctable(&self) -> bool {
        matches!(self, EngineError::Execution { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_mentions_data_source() {
        let err = EngineError::Connection {
            data_source_id: "orders-db".to_string(),
            dialect: DialectKind::Postgres,
            cause: "connection refused".to_string(),
        };
        let msg = err.user_message();
        assert!(msg.contains("orders-db"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_only_execution_errors_are_correctable() {
        assert!(
            EngineError::Execution {
                cause: "no such column".to_string()
            }
            .is_correctable()
        );
        assert!(!EngineError::UnsafeSqlRejected("DELETE".to_string()).is_correctable());
        assert!(!EngineError::Timeout { seconds: 30 }.is_correctable());
    }
}
