//! Connection registry: one pooled connection handle per data source identity
//!
//! An explicit registry object with a defined lifecycle: created with the
//! engine, torn down by [`ConnectionRegistry::shutdown`]. Pools are created
//! lazily with single-flight semantics (concurrent callers for the same
//! identity share one creation) and reused across calls; concurrency inside a
//! handle is the pool's own business, never the caller's.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Column, Row, ValueRef};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::datasource::{DataSourceDescriptor, HealthStatus, sanitize_url};
use crate::dialect::dialect_adapter;
use crate::error::{EngineError, EngineResult};

static DRIVERS: Once = Once::new();

/// Install the compiled-in sqlx drivers for the `Any` connection layer.
/// Idempotent.
pub(crate) fn ensure_drivers() {
    DRIVERS.call_once(sqlx::any::install_default_drivers);
}

/// Result of executing a read-only statement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub cached: bool,
}

/// Outcome of a connectivity probe; never an error
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProbe {
    pub ok: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

pub struct ConnectionRegistry {
    pools: Mutex<HashMap<String, Arc<OnceCell<AnyPool>>>>,
    health: RwLock<HashMap<String, HealthStatus>>,
    connect_timeout: Duration,
    created: AtomicUsize,
}

impl ConnectionRegistry {
    pub fn new(connect_timeout: Duration) -> Self {
        ensure_drivers();
        Self {
            pools: Mutex::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
            connect_timeout,
            created: AtomicUsize::new(0),
        }
    }

    /// Acquire the pooled handle for a data source, creating it on first use.
    ///
    /// Idempotent per identity: concurrent callers share a single in-flight
    /// creation and reuse its result. A creation failure flips the source's
    /// health to `Unreachable` and is surfaced as a typed error.
    pub async fn acquire(&self, descriptor: &DataSourceDescriptor) -> EngineResult<AnyPool> {
        let cell = {
            let mut pools = self.pools.lock().unwrap();
            pools
                .entry(descriptor.id.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        match cell.get_or_try_init(|| self.create_pool(descriptor)).await {
            Ok(pool) => {
                self.set_health(&descriptor.id, HealthStatus::Healthy);
                Ok(pool.clone())
            }
            Err(err) => {
                if matches!(err, EngineError::Connection { .. }) {
                    self.set_health(&descriptor.id, HealthStatus::Unreachable);
                }
                Err(err)
            }
        }
    }

    async fn create_pool(&self, descriptor: &DataSourceDescriptor) -> EngineResult<AnyPool> {
        let adapter = dialect_adapter(descriptor.dialect);
        if !adapter.driver_available() {
            return Err(EngineError::UnsupportedDialectOperation {
                dialect: descriptor.dialect,
                operation: "opening connections (no bundled driver)".to_string(),
            });
        }

        let url = adapter.connection_url(&descriptor.params)?;
        debug!(
            data_source = %descriptor.id,
            url = %sanitize_url(&url),
            "creating connection pool"
        );

        let connect = AnyPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(self.connect_timeout)
            .test_before_acquire(false)
            .connect(&url);

        let pool = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| EngineError::Connection {
                data_source_id: descriptor.id.clone(),
                dialect: descriptor.dialect,
                cause: format!(
                    "connection attempt exceeded {}s",
                    self.connect_timeout.as_secs()
                ),
            })?
            .map_err(|e| EngineError::Connection {
                data_source_id: descriptor.id.clone(),
                dialect: descriptor.dialect,
                cause: e.to_string(),
            })?;

        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(pool)
    }

    /// Create-and-probe without throwing: connection plus a `SELECT 1`
    /// round trip, reported as a structured outcome.
    pub async fn test_connection(&self, descriptor: &DataSourceDescriptor) -> ConnectionProbe {
        let started = Instant::now();
        let pool = match self.acquire(descriptor).await {
            Ok(pool) => pool,
            Err(err) => {
                return ConnectionProbe {
                    ok: false,
                    latency_ms: started.elapsed().as_millis() as u64,
                    error: Some(err.user_message()),
                };
            }
        };

        let probe = tokio::time::timeout(
            self.connect_timeout,
            sqlx::query("SELECT 1").fetch_one(&pool),
        )
        .await;

        match probe {
            Ok(Ok(_)) => ConnectionProbe {
                ok: true,
                latency_ms: started.elapsed().as_millis() as u64,
                error: None,
            },
            Ok(Err(e)) => {
                self.set_health(&descriptor.id, HealthStatus::Unreachable);
                ConnectionProbe {
                    ok: false,
                    latency_ms: started.elapsed().as_millis() as u64,
                    error: Some(e.to_string()),
                }
            }
            Err(_) => {
                self.set_health(&descriptor.id, HealthStatus::Unreachable);
                ConnectionProbe {
                    ok: false,
                    latency_ms: started.elapsed().as_millis() as u64,
                    error: Some("round-trip query timed out".to_string()),
                }
            }
        }
    }

    /// Close and forget the pool for a data source
    pub async fn invalidate(&self, data_source_id: &str) {
        let cell = self.pools.lock().unwrap().remove(data_source_id);
        if let Some(cell) = cell {
            if let Some(pool) = cell.get() {
                pool.close().await;
            }
        }
        self.health.write().unwrap().remove(data_source_id);
    }

    /// Close every pool; the registry is unusable-by-convention afterwards
    pub async fn shutdown(&self) {
        let cells: Vec<Arc<OnceCell<AnyPool>>> =
            self.pools.lock().unwrap().drain().map(|(_, c)| c).collect();
        for cell in cells {
            if let Some(pool) = cell.get() {
                pool.close().await;
            }
        }
    }

    /// Last observed health for a data source id
    pub fn health(&self, data_source_id: &str) -> HealthStatus {
        self.health
            .read()
            .unwrap()
            .get(data_source_id)
            .copied()
            .unwrap_or_default()
    }

    fn set_health(&self, data_source_id: &str, status: HealthStatus) {
        self.health
            .write()
            .unwrap()
            .insert(data_source_id.to_string(), status);
    }

    /// Number of pools created since startup; diagnostics only
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

/// Fetch rows for an internal query (introspection) under a timeout
pub(crate) async fn fetch_rows(
    pool: &AnyPool,
    sql: &str,
    timeout: Duration,
) -> EngineResult<Vec<sqlx::any::AnyRow>> {
    tokio::time::timeout(timeout, sqlx::query(sql).fetch_all(pool))
        .await
        .map_err(|_| EngineError::Timeout {
            seconds: timeout.as_secs(),
        })?
        .map_err(EngineError::from)
}

/// Execute a statement that already passed the safety gate and decode the
/// result set into a dialect-neutral shape.
pub async fn execute(pool: &AnyPool, sql: &str, timeout: Duration) -> EngineResult<QueryResult> {
    let started = Instant::now();
    let rows = tokio::time::timeout(timeout, sqlx::query(sql).fetch_all(pool))
        .await
        .map_err(|_| EngineError::Timeout {
            seconds: timeout.as_secs(),
        })?
        .map_err(|e| EngineError::Execution {
            cause: e.to_string(),
        })?;
    let execution_time_ms = started.elapsed().as_millis() as u64;

    let columns: Vec<String> = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let mut mapped = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut object = serde_json::Map::with_capacity(columns.len());
        for (idx, name) in columns.iter().enumerate() {
            object.insert(name.clone(), decode_column(row, idx));
        }
        mapped.push(object);
    }

    let row_count = mapped.len();
    debug!(rows = row_count, elapsed_ms = execution_time_ms, "query executed");

    Ok(QueryResult {
        columns,
        rows: mapped,
        row_count,
        execution_time_ms,
        cached: false,
    })
}

/// Decode a single column into JSON through the `Any` driver.
///
/// The `Any` layer exposes a narrow set of decodable types, so decoding walks
/// an ordered fallback chain; values outside it come back as null.
pub(crate) fn decode_column(row: &sqlx::any::AnyRow, idx: usize) -> serde_json::Value {
    if let Ok(raw) = row.try_get_raw(idx) {
        if raw.is_null() {
            return serde_json::Value::Null;
        }
    }
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return serde_json::Value::from(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return serde_json::json!(v);
    }
    if let Ok(v) = row.try_get::<bool, _>(idx) {
        return serde_json::Value::from(v);
    }
    if let Ok(v) = row.try_get::<String, _>(idx) {
        return serde_json::Value::from(v);
    }
    warn!(column = idx, "undecodable column value, substituting null");
    serde_json::Value::Null
}
