//! Natural-language-to-SQL query engine with retrieval-augmented generation
//!
//! The engine answers a question against a configured data source: it
//! introspects the schema, grounds an LLM prompt with retrieved schema
//! documents, runs the candidate SQL through a read-only safety gate, serves
//! or populates an adaptive result cache, and repairs a failed statement at
//! most once — all driven by an explicit request state machine with
//! cancellation.
//!
//! # Usage
//!
//! ```rust,no_run
//! use askdb::{ConnectionParams, DataSourceDescriptor, DialectKind, EngineConfig, QueryEngine};
//!
//! # async fn example() -> askdb::EngineResult<()> {
//! let engine = QueryEngine::new(EngineConfig::default()).await;
//! engine.register_data_source(DataSourceDescriptor::new(
//!     "sales",
//!     "Sales warehouse",
//!     DialectKind::Postgres,
//!     ConnectionParams::network("db.internal", None, "sales", "reader", None),
//! ));
//! engine.index_data_source("sales").await?;
//! let _ask_id = engine.submit("top 5 customers by revenue", "sales", Vec::new())?;
//! # Ok(())
//! # }
//! ```

pub mod ask;
pub mod cache;
pub mod config;
pub mod correction;
pub mod datasource;
pub mod dialect;
pub mod error;
pub mod generation;
pub mod indexer;
pub mod logging;
pub mod pool;
pub mod providers;
pub mod safety;
pub mod schema;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;
use uuid::Uuid;

pub use ask::{AskHistoryTurn, AskRequest, AskStatus};
pub use cache::{CacheStats, ResultCache};
pub use config::EngineConfig;
pub use datasource::{ConnectionParams, DataSourceDescriptor, DialectKind, HealthStatus};
pub use dialect::{DialectAdapter, dialect_adapter};
pub use error::{EngineError, EngineResult, ProviderKind};
pub use indexer::{IndexingReport, SchemaIndexer};
pub use pool::{ConnectionProbe, ConnectionRegistry, QueryResult};
pub use providers::{ProviderHealth, ProviderSet, RetrievedDocument};
pub use safety::SafeSql;
pub use schema::{ColumnDescriptor, SchemaDescriptor, SchemaIntrospector, TableDescriptor};

use ask::{AskContext, AskTracker, run_ask};
use correction::SqlCorrectionPipeline;
use generation::SqlGenerationPipeline;

/// The engine facade: owns the connection registry, result cache, schema
/// introspector, provider set, and the Ask orchestrator.
pub struct QueryEngine {
    ctx: Arc<AskContext>,
    catalog: RwLock<HashMap<String, DataSourceDescriptor>>,
    providers: ProviderSet,
    indexer: SchemaIndexer,
}

impl QueryEngine {
    /// Create an engine, resolving providers from configuration and
    /// environment. Production paths resolve each capability to its real
    /// implementation or to a fail-fast NotConfigured variant.
    pub async fn new(config: EngineConfig) -> Self {
        let providers = ProviderSet::resolve(&config.providers, config.provider_timeout()).await;
        Self::with_providers(config, providers)
    }

    /// Create an engine with an explicit provider set (test harnesses)
    pub fn with_providers(config: EngineConfig, providers: ProviderSet) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.connect_timeout()));
        let cache = Arc::new(ResultCache::new(config.cache_enabled));
        let introspector = Arc::new(SchemaIntrospector::new(
            config.schema_cache_ttl(),
            config.provider_timeout(),
        ));
        let generation = SqlGenerationPipeline::new(
            providers.clone(),
            config.retrieval_top_k,
            config.history_turns,
            config.provider_timeout(),
        );
        let correction = SqlCorrectionPipeline::new(
            providers.clone(),
            config.retrieval_top_k,
            config.provider_timeout(),
        );

        let ctx = Arc::new(AskContext {
            config,
            registry,
            cache,
            introspector,
            generation,
            correction,
            tracker: Arc::new(AskTracker::default()),
        });
        let indexer = SchemaIndexer::new(providers.clone());

        Self {
            ctx,
            catalog: RwLock::new(HashMap::new()),
            providers,
            indexer,
        }
    }

    /// Make a data source available to Asks. The engine reads only the
    /// descriptor's id, dialect, and connection parameters.
    pub fn register_data_source(&self, descriptor: DataSourceDescriptor) {
        info!(data_source = %descriptor.id, dialect = %descriptor.dialect, "data source registered");
        self.catalog
            .write()
            .unwrap()
            .insert(descriptor.id.clone(), descriptor);
    }

    /// Remove a data source: closes its pool, drops its cache entries and
    /// schema snapshot.
    pub async fn remove_data_source(&self, data_source_id: &str) {
        self.catalog.write().unwrap().remove(data_source_id);
        self.ctx.registry.invalidate(data_source_id).await;
        self.ctx.cache.invalidate(data_source_id);
        self.ctx.introspector.evict(data_source_id);
    }

    fn descriptor(&self, data_source_id: &str) -> EngineResult<DataSourceDescriptor> {
        self.catalog
            .read()
            .unwrap()
            .get(data_source_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDataSource(data_source_id.to_string()))
    }

    /// Probe connectivity without throwing
    pub async fn test_connection(&self, data_source_id: &str) -> EngineResult<ConnectionProbe> {
        let descriptor = self.descriptor(data_source_id)?;
        Ok(self.ctx.registry.test_connection(&descriptor).await)
    }

    /// Last observed health of a data source
    pub fn data_source_health(&self, data_source_id: &str) -> HealthStatus {
        self.ctx.registry.health(data_source_id)
    }

    /// Introspect and (re)index a data source's schema into the vector store
    pub async fn index_data_source(&self, data_source_id: &str) -> EngineResult<IndexingReport> {
        let descriptor = self.descriptor(data_source_id)?;
        let schema = self
            .ctx
            .introspector
            .introspect(&self.ctx.registry, &descriptor)
            .await?;
        self.indexer.index_schema(data_source_id, &schema).await
    }

    /// Submit a question; the Ask runs on its own task. Returns the Ask id.
    pub fn submit(
        &self,
        question: &str,
        data_source_id: &str,
        history: Vec<AskHistoryTurn>,
    ) -> EngineResult<Uuid> {
        let descriptor = self.descriptor(data_source_id)?;
        let ask = AskRequest::new(question.to_string(), data_source_id.to_string(), history);
        let id = ask.id;
        self.ctx.tracker.insert(ask);

        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(run_ask(ctx, id, descriptor));
        Ok(id)
    }

    /// Current snapshot of an Ask
    pub fn snapshot(&self, ask_id: Uuid) -> Option<AskRequest> {
        self.ctx.tracker.snapshot(ask_id)
    }

    /// Cancel an Ask. In-flight provider or database calls are not
    /// interrupted, but their results are discarded when they return.
    pub fn stop(&self, ask_id: Uuid) -> bool {
        self.ctx.tracker.stop(ask_id)
    }

    /// Which provider variant is active per capability
    pub async fn provider_health(&self) -> ProviderHealth {
        self.providers.health().await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.ctx.cache.stats()
    }

    /// Invalidate cached results for a data source, optionally scoped to
    /// SQL that referenced a table matching the hint
    pub fn invalidate_cache(&self, data_source_id: &str, table_hint: Option<&str>) {
        match table_hint {
            Some(hint) => self.ctx.cache.invalidate_table(data_source_id, hint),
            None => self.ctx.cache.invalidate(data_source_id),
        }
    }

    /// Close every connection pool
    pub async fn shutdown(&self) {
        self.ctx.registry.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{MockEmbeddings, MockLlm, MockVectorStore, NotConfiguredLlm};
    use std::time::Duration;

    async fn sqlite_fixture(id: &str) -> (tempfile::TempPath, DataSourceDescriptor) {
        pool::ensure_drivers();
        let path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        let descriptor = DataSourceDescriptor::new(
            id,
            "fixture",
            DialectKind::Sqlite,
            ConnectionParams::file(path.to_str().unwrap()),
        );

        let url = format!("sqlite://{}", path.to_str().unwrap());
        let pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .unwrap();
        for statement in [
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER NOT NULL, amount REAL NOT NULL)",
            "INSERT INTO customers (id, name) VALUES (1, 'Acme'), (2, 'Globex'), (3, 'Initech')",
            "INSERT INTO orders (id, customer_id, amount) VALUES \
             (1, 1, 120.0), (2, 1, 80.0), (3, 2, 300.0), (4, 3, 50.0)",
        ] {
            sqlx::query(statement).execute(&pool).await.unwrap();
        }
        pool.close().await;

        (path, descriptor)
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            connect_timeout_secs: 5,
            execution_timeout_secs: 5,
            provider_timeout_secs: 5,
            ..EngineConfig::default()
        }
    }

    async fn wait_terminal(engine: &QueryEngine, id: Uuid) -> AskRequest {
        for _ in 0..400 {
            if let Some(snapshot) = engine.snapshot(id) {
                if snapshot.status.is_terminal() {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("ask did not reach a terminal state");
    }

    #[tokio::test]
    async fn test_top_customers_end_to_end() {
        let (_path, descriptor) = sqlite_fixture("ds-e2e").await;
        let engine = QueryEngine::with_providers(test_config(), ProviderSet::mock());
        engine.register_data_source(descriptor);

        let report = engine.index_data_source("ds-e2e").await.unwrap();
        assert_eq!(report.tables_indexed, 2);
        assert!(report.relationships_indexed >= 1);

        let id = engine
            .submit("top 5 customers by revenue", "ds-e2e", Vec::new())
            .unwrap();
        let ask = wait_terminal(&engine, id).await;

        assert_eq!(ask.status, AskStatus::Completed, "error: {:?}", ask.error);
        let sql = ask.generated_sql.unwrap();
        assert!(sql.contains("customers"), "{sql}");
        assert!(sql.contains("orders"), "{sql}");
        assert!(sql.contains("LIMIT 5"), "{sql}");

        let result = ask.result.unwrap();
        assert!(result.row_count > 0);
        assert!(!result.cached);
        assert!(ask.confidence.unwrap() > 0.5);
        assert_eq!(ask.generation_passes, 1);
        assert!(!ask.correction_used);

        // Same question again: the cache answers
        let second = engine
            .submit("top 5 customers by revenue", "ds-e2e", Vec::new())
            .unwrap();
        let cached_ask = wait_terminal(&engine, second).await;
        assert_eq!(cached_ask.status, AskStatus::Completed);
        let cached_result = cached_ask.result.unwrap();
        assert!(cached_result.cached);
        assert_eq!(cached_result.execution_time_ms, 0);
        assert_eq!(cached_result.rows, result.rows);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_execution_error_triggers_exactly_one_correction() {
        let (_path, descriptor) = sqlite_fixture("ds-correct").await;
        let providers = ProviderSet {
            llm: Arc::new(MockLlm::with_responses(vec![
                "SQL: SELECT revenue FROM customers;",
                "CORRECTED_SQL: SELECT name FROM customers LIMIT 5;\nEXPLANATION: replaced the missing column",
            ])),
            embeddings: Arc::new(MockEmbeddings::default()),
            vector_store: Arc::new(MockVectorStore::default()),
        };
        let engine = QueryEngine::with_providers(test_config(), providers);
        engine.register_data_source(descriptor);

        let id = engine.submit("customer revenue", "ds-correct", Vec::new()).unwrap();
        let ask = wait_terminal(&engine, id).await;

        assert_eq!(ask.status, AskStatus::Completed, "error: {:?}", ask.error);
        assert!(ask.correction_used);
        assert_eq!(ask.generation_passes, 2);
        assert!(ask.generated_sql.unwrap().contains("name"));
        assert_eq!(ask.result.unwrap().row_count, 3);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_correction_terminates_with_last_sql() {
        let (_path, descriptor) = sqlite_fixture("ds-correct-fail").await;
        let providers = ProviderSet {
            llm: Arc::new(MockLlm::with_responses(vec![
                "SQL: SELECT revenue FROM customers;",
                "CORRECTED_SQL: SELECT still_wrong FROM customers LIMIT 5;",
            ])),
            embeddings: Arc::new(MockEmbeddings::default()),
            vector_store: Arc::new(MockVectorStore::default()),
        };
        let engine = QueryEngine::with_providers(test_config(), providers);
        engine.register_data_source(descriptor);

        let id = engine
            .submit("customer revenue", "ds-correct-fail", Vec::new())
            .unwrap();
        let ask = wait_terminal(&engine, id).await;

        assert_eq!(ask.status, AskStatus::Failed);
        assert!(ask.correction_used);
        assert_eq!(ask.generation_passes, 2);
        let error = ask.error.unwrap();
        assert!(!error.is_empty());
        assert!(error.contains("still_wrong"), "{error}");

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_data_source_fails_and_flips_health() {
        let engine = QueryEngine::with_providers(
            EngineConfig {
                connect_timeout_secs: 2,
                ..test_config()
            },
            ProviderSet::mock(),
        );
        engine.register_data_source(DataSourceDescriptor::new(
            "ds-down",
            "down",
            DialectKind::Postgres,
            ConnectionParams::network("127.0.0.1", Some(1), "nope", "nobody", None),
        ));

        let id = engine.submit("anything", "ds-down", Vec::new()).unwrap();
        let ask = wait_terminal(&engine, id).await;

        assert_eq!(ask.status, AskStatus::Failed);
        assert!(ask.error.unwrap().contains("ds-down"));
        assert_eq!(engine.data_source_health("ds-down"), HealthStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_degraded_mode_without_llm_still_completes() {
        let (_path, descriptor) = sqlite_fixture("ds-degraded").await;
        let providers = ProviderSet {
            llm: Arc::new(NotConfiguredLlm {
                reason: "no key".to_string(),
            }),
            embeddings: Arc::new(MockEmbeddings::default()),
            vector_store: Arc::new(MockVectorStore::default()),
        };
        let engine = QueryEngine::with_providers(test_config(), providers);
        engine.register_data_source(descriptor);

        let id = engine.submit("top customers", "ds-degraded", Vec::new()).unwrap();
        let ask = wait_terminal(&engine, id).await;

        assert_eq!(ask.status, AskStatus::Completed, "error: {:?}", ask.error);
        assert!(ask.confidence.unwrap() <= 0.3);
        assert!(ask.explanation.unwrap().to_lowercase().contains("degraded"));
        assert!(ask.generated_sql.unwrap().contains("degraded_mode"));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_discards_in_flight_result() {
        let (_path, descriptor) = sqlite_fixture("ds-stop").await;
        let providers = ProviderSet {
            llm: Arc::new(MockLlm::with_delay(Duration::from_millis(500))),
            embeddings: Arc::new(MockEmbeddings::default()),
            vector_store: Arc::new(MockVectorStore::default()),
        };
        let engine = QueryEngine::with_providers(test_config(), providers);
        engine.register_data_source(descriptor);

        let id = engine.submit("top customers", "ds-stop", Vec::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.stop(id));

        let ask = wait_terminal(&engine, id).await;
        assert_eq!(ask.status, AskStatus::Stopped);
        assert!(ask.result.is_none());

        // Give the orchestrator task time to observe the stop and exit; the
        // status must not move afterwards.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(engine.snapshot(id).unwrap().status, AskStatus::Stopped);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_data_source_is_rejected_at_submit() {
        let engine = QueryEngine::with_providers(test_config(), ProviderSet::mock());
        let err = engine.submit("anything", "nowhere", Vec::new()).unwrap_err();
        assert!(matches!(err, EngineError::UnknownDataSource(_)));
    }

    #[tokio::test]
    async fn test_remove_data_source_clears_cache_and_pool() {
        let (_path, descriptor) = sqlite_fixture("ds-remove").await;
        let engine = QueryEngine::with_providers(test_config(), ProviderSet::mock());
        engine.register_data_source(descriptor);

        let id = engine.submit("top customers", "ds-remove", Vec::new()).unwrap();
        wait_terminal(&engine, id).await;

        engine.remove_data_source("ds-remove").await;
        let err = engine.submit("again", "ds-remove", Vec::new()).unwrap_err();
        assert!(matches!(err, EngineError::UnknownDataSource(_)));
        assert_eq!(engine.cache_stats().entries, 0);
    }
}
