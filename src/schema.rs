//! Schema introspection: one normalized descriptor shape for every dialect
//!
//! Snapshots are immutable, tagged with the data source identity and a fetch
//! timestamp, and cached for a short TTL so repeated Asks against the same
//! source do not hammer the catalog.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::datasource::DataSourceDescriptor;
use crate::dialect::{DialectAdapter, dialect_adapter};
use crate::error::{EngineError, EngineResult};
use crate::pool::{ConnectionRegistry, decode_column, fetch_rows};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
}

/// Immutable snapshot of a data source's schema
#[derive(Debug, Clone, Serialize)]
pub struct SchemaDescriptor {
    pub data_source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub tables: Vec<TableDescriptor>,
    /// Tables skipped because their metadata was unreadable
    pub warning_count: usize,
}

impl SchemaDescriptor {
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name == name)
    }
}

pub struct SchemaIntrospector {
    cache: RwLock<HashMap<String, (SchemaDescriptor, Instant)>>,
    cache_ttl: Duration,
    query_timeout: Duration,
}

impl SchemaIntrospector {
    pub fn new(cache_ttl: Duration, query_timeout: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            cache_ttl,
            query_timeout,
        }
    }

    /// Produce (or reuse) a normalized schema snapshot for a data source
    pub async fn introspect(
        &self,
        registry: &ConnectionRegistry,
        descriptor: &DataSourceDescriptor,
    ) -> EngineResult<SchemaDescriptor> {
        if let Some(cached) = self.cached(&descriptor.id) {
            debug!(data_source = %descriptor.id, "using cached schema snapshot");
            return Ok(cached);
        }
        self.refresh(registry, descriptor).await
    }

    /// Bypass the snapshot cache and re-read the catalog
    pub async fn refresh(
        &self,
        registry: &ConnectionRegistry,
        descriptor: &DataSourceDescriptor,
    ) -> EngineResult<SchemaDescriptor> {
        let schema = self.introspect_uncached(registry, descriptor).await?;
        self.cache.write().unwrap().insert(
            descriptor.id.clone(),
            (schema.clone(), Instant::now()),
        );
        Ok(schema)
    }

    /// Forget the cached snapshot for a data source
    pub fn evict(&self, data_source_id: &str) {
        self.cache.write().unwrap().remove(data_source_id);
    }

    fn cached(&self, data_source_id: &str) -> Option<SchemaDescriptor> {
        let cache = self.cache.read().unwrap();
        cache.get(data_source_id).and_then(|(schema, at)| {
            (at.elapsed() < self.cache_ttl).then(|| schema.clone())
        })
    }

    async fn introspect_uncached(
        &self,
        registry: &ConnectionRegistry,
        descriptor: &DataSourceDescriptor,
    ) -> EngineResult<SchemaDescriptor> {
        let adapter = dialect_adapter(descriptor.dialect);
        let pool = registry.acquire(descriptor).await?;

        let (tables, warning_count) = if let Some(catalog_sql) = adapter.catalog_query() {
            let rows = fetch_rows(&pool, catalog_sql, self.query_timeout).await?;
            collect_catalog_rows(&rows)
        } else {
            self.introspect_per_object(&pool, adapter).await?
        };

        info!(
            data_source = %descriptor.id,
            tables = tables.len(),
            warnings = warning_count,
            "schema introspected"
        );

        Ok(SchemaDescriptor {
            data_source_id: descriptor.id.clone(),
            fetched_at: Utc::now(),
            tables,
            warning_count,
        })
    }

    /// Enumerate objects, then query structure per object. A single
    /// unreadable table is skipped with a warning; the snapshot only fails
    /// when every listed table is unreadable.
    async fn introspect_per_object(
        &self,
        pool: &sqlx::AnyPool,
        adapter: &dyn DialectAdapter,
    ) -> EngineResult<(Vec<TableDescriptor>, usize)> {
        let list_sql = adapter.object_list_query().ok_or_else(|| {
            EngineError::Schema(format!(
                "{} provides neither a catalog query nor object enumeration",
                adapter.kind()
            ))
        })?;

        let name_rows = fetch_rows(pool, list_sql, self.query_timeout).await?;
        let names: Vec<String> = name_rows
            .iter()
            .map(|row| value_to_string(&decode_column(row, 0)))
            .filter(|n| !n.is_empty())
            .collect();

        let mut tables = Vec::with_capacity(names.len());
        let mut warning_count = 0usize;
        for name in &names {
            let detail_sql = match adapter.object_detail_query(name) {
                Some(sql) => sql,
                None => continue,
            };
            match fetch_rows(pool, &detail_sql, self.query_timeout).await {
                Ok(rows) => {
                    // PRAGMA table_info: (cid, name, type, notnull, dflt_value, pk)
                    let columns: Vec<ColumnDescriptor> = rows
                        .iter()
                        .map(|row| ColumnDescriptor {
                            name: value_to_string(&decode_column(row, 1)),
                            data_type: value_to_string(&decode_column(row, 2)),
                            nullable: !value_to_bool(&decode_column(row, 3)),
                            is_primary_key: value_to_bool(&decode_column(row, 5)),
                        })
                        .collect();
                    tables.push(TableDescriptor {
                        name: name.clone(),
                        columns,
                    });
                }
                Err(e) => {
                    warn!(table = %name, error = %e, "skipping unreadable table");
                    warning_count += 1;
                }
            }
        }

        if tables.is_empty() && !names.is_empty() {
            return Err(EngineError::Schema(format!(
                "all {} tables failed introspection",
                names.len()
            )));
        }
        Ok((tables, warning_count))
    }
}

/// Fold ordered catalog rows (table, column, type, nullable, pk) into table
/// descriptors, skipping rows that do not decode.
fn collect_catalog_rows(rows: &[sqlx::any::AnyRow]) -> (Vec<TableDescriptor>, usize) {
    let mut tables: Vec<TableDescriptor> = Vec::new();
    let mut warning_count = 0usize;

    for row in rows {
        let table_name = value_to_string(&decode_column(row, 0));
        let column_name = value_to_string(&decode_column(row, 1));
        if table_name.is_empty() || column_name.is_empty() {
            warning_count += 1;
            continue;
        }
        let column = ColumnDescriptor {
            name: column_name,
            data_type: value_to_string(&decode_column(row, 2)),
            nullable: value_to_bool(&decode_column(row, 3)),
            is_primary_key: value_to_bool(&decode_column(row, 4)),
        };
        match tables.last_mut() {
            Some(table) if table.name == table_name => table.columns.push(column),
            _ => tables.push(TableDescriptor {
                name: table_name,
                columns: vec![column],
            }),
        }
    }
    (tables, warning_count)
}

fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Catalog columns encode booleans as YES/NO strings, integers, or booleans
/// depending on the dialect
fn value_to_bool(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_i64().is_some_and(|v| v != 0),
        serde_json::Value::String(s) => {
            matches!(s.to_ascii_lowercase().as_str(), "yes" | "true" | "1")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{ConnectionParams, DialectKind};

    async fn seeded_sqlite() -> (tempfile::TempPath, DataSourceDescriptor, ConnectionRegistry) {
        let path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        let descriptor = DataSourceDescriptor::new(
            "ds-schema-test",
            "schema test",
            DialectKind::Sqlite,
            ConnectionParams::file(path.to_str().unwrap()),
        );
        let registry = ConnectionRegistry::new(Duration::from_secs(5));
        let pool = registry.acquire(&descriptor).await.unwrap();
        for ddl in [
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER NOT NULL, amount REAL)",
        ] {
            sqlx::query(ddl).execute(&pool).await.unwrap();
        }
        (path, descriptor, registry)
    }

    #[tokio::test]
    async fn test_sqlite_introspection_normalizes_shape() {
        let (_path, descriptor, registry) = seeded_sqlite().await;
        let introspector =
            SchemaIntrospector::new(Duration::from_secs(300), Duration::from_secs(5));

        let schema = introspector.introspect(&registry, &descriptor).await.unwrap();
        assert_eq!(schema.data_source_id, "ds-schema-test");
        assert_eq!(schema.warning_count, 0);

        let names: Vec<&str> = schema.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["customers", "orders"]);

        let customers = schema.table("customers").unwrap();
        let id = &customers.columns[0];
        assert_eq!(id.name, "id");
        assert!(id.is_primary_key);
        let name = &customers.columns[1];
        assert!(!name.nullable);
        assert!(!name.is_primary_key);

        let amount = &schema.table("orders").unwrap().columns[2];
        assert_eq!(amount.name, "amount");
        assert!(amount.nullable);
    }

    #[tokio::test]
    async fn test_introspection_is_idempotent() {
        let (_path, descriptor, registry) = seeded_sqlite().await;
        let introspector =
            SchemaIntrospector::new(Duration::from_secs(300), Duration::from_secs(5));

        let first = introspector.refresh(&registry, &descriptor).await.unwrap();
        let second = introspector.refresh(&registry, &descriptor).await.unwrap();
        assert_eq!(first.tables, second.tables);
    }

    #[tokio::test]
    async fn test_snapshot_cache_reused_within_ttl() {
        let (_path, descriptor, registry) = seeded_sqlite().await;
        let introspector =
            SchemaIntrospector::new(Duration::from_secs(300), Duration::from_secs(5));

        let first = introspector.introspect(&registry, &descriptor).await.unwrap();
        let second = introspector.introspect(&registry, &descriptor).await.unwrap();
        assert_eq!(first.fetched_at, second.fetched_at);

        introspector.evict(&descriptor.id);
        let third = introspector.introspect(&registry, &descriptor).await.unwrap();
        assert!(third.fetched_at >= first.fetched_at);
    }

    #[test]
    fn test_value_coercions() {
        assert!(value_to_bool(&serde_json::json!("YES")));
        assert!(value_to_bool(&serde_json::json!(1)));
        assert!(!value_to_bool(&serde_json::json!("NO")));
        assert!(!value_to_bool(&serde_json::Value::Null));
        assert_eq!(value_to_string(&serde_json::json!("orders")), "orders");
        assert_eq!(value_to_string(&serde_json::json!(7)), "7");
    }
}
