//! Adaptive result cache for executed queries
//!
//! Content-addressed on (data source id, normalized SQL) with a TTL that
//! adapts to observed execution cost, plus a secondary (data source, table)
//! index so entries can be invalidated by table name without pattern-scanning
//! the backend.

use std::collections::{HashMap, HashSet};
use std::sync::{LazyLock, RwLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::pool::QueryResult;

const MAX_CACHEABLE_ROWS: usize = 10_000;
const MAX_CACHEABLE_EXEC_MS: u64 = 30_000;
const BASE_TTL: Duration = Duration::from_secs(3600);
const MAX_TTL: Duration = Duration::from_secs(6 * 3600);
const MUTABLE_INTENT_TTL: Duration = Duration::from_secs(1800);

static VOLATILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(rand|random|now|current_timestamp|current_time|current_date)\b").unwrap()
});
static MUTABLE_INTENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(count|sum|avg|max|min|recent|today|latest)\b").unwrap()
});
static TABLE_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\b(?:from|join)\s+([a-z_][a-z0-9_."`]*)"#).unwrap());

#[derive(Debug, Clone)]
struct CacheEntry {
    data_source_id: String,
    columns: Vec<String>,
    rows: Vec<serde_json::Map<String, serde_json::Value>>,
    row_count: usize,
    cached_at: Instant,
    ttl: Duration,
    tables: Vec<String>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: usize,
    pub misses: usize,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    table_index: HashMap<(String, String), HashSet<String>>,
    hits: usize,
    misses: usize,
}

/// Result cache keyed by data source identity and normalized SQL text.
///
/// Safe for concurrent use. Duplicate concurrent misses for the same key may
/// both execute; population is last-writer-wins.
pub struct ResultCache {
    inner: RwLock<CacheInner>,
    enabled: bool,
}

/// Lowercase, collapse whitespace, strip the trailing semicolon
pub fn normalize_sql(sql: &str) -> String {
    sql.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(';')
        .trim_end()
        .to_string()
}

/// Cache key: SHA-256 over data source identity and normalized SQL
pub fn cache_key(data_source_id: &str, sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data_source_id.as_bytes());
    hasher.update([0]);
    hasher.update(normalize_sql(sql).as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether a statement is eligible for caching at all: read-only and free of
/// volatile functions whose results drift between executions.
pub fn should_cache(sql: &str) -> bool {
    let normalized = normalize_sql(sql);
    if !(normalized.starts_with("select") || normalized.starts_with("with")) {
        return false;
    }
    !VOLATILE_RE.is_match(&normalized)
}

/// TTL policy: longer for expensive queries, short for aggregation-flavored
/// SQL whose answer the user expects to move, capped globally.
pub fn compute_ttl(sql: &str, execution_time_ms: u64) -> Duration {
    let mut ttl = if execution_time_ms >= 5_000 {
        BASE_TTL * 3
    } else if execution_time_ms >= 1_000 {
        BASE_TTL * 2
    } else {
        BASE_TTL
    };
    if MUTABLE_INTENT_RE.is_match(&normalize_sql(sql)) {
        ttl = ttl.min(MUTABLE_INTENT_TTL);
    }
    ttl.min(MAX_TTL)
}

/// Table names referenced in FROM/JOIN clauses, lowercased and unquoted
pub(crate) fn referenced_tables(sql: &str) -> Vec<String> {
    let mut tables = Vec::new();
    for caps in TABLE_REF_RE.captures_iter(sql) {
        let raw = caps[1].trim_matches(|c| c == '"' || c == '`');
        let name = raw.rsplit('.').next().unwrap_or(raw).to_lowercase();
        if !name.is_empty() && !tables.contains(&name) {
            tables.push(name);
        }
    }
    tables
}

impl ResultCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                entries: HashMap::new(),
                table_index: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
            enabled,
        }
    }

    /// Look up a cached result. Hits come back flagged `cached = true` with a
    /// zero execution time.
    pub fn lookup(&self, data_source_id: &str, sql: &str) -> Option<QueryResult> {
        if !self.enabled {
            return None;
        }
        let key = cache_key(data_source_id, sql);
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;

        let expired = matches!(inner.entries.get(&key), Some(entry) if entry.is_expired());
        if expired {
            remove_entry(inner, data_source_id, &key);
        }
        match inner.entries.get(&key) {
            Some(entry) => {
                let result = QueryResult {
                    columns: entry.columns.clone(),
                    rows: entry.rows.clone(),
                    row_count: entry.row_count,
                    execution_time_ms: 0,
                    cached: true,
                };
                inner.hits += 1;
                Some(result)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Store an executed result. Returns false when the write was skipped;
    /// a skipped write is a logged decision, not an error.
    pub fn store(&self, data_source_id: &str, sql: &str, result: &QueryResult) -> bool {
        if !self.enabled {
            return false;
        }
        if !should_cache(sql) {
            debug!(data_source = data_source_id, "cache write skipped: statement not cacheable");
            return false;
        }
        if result.row_count == 0 {
            debug!(data_source = data_source_id, "cache write skipped: empty result set");
            return false;
        }
        if result.row_count > MAX_CACHEABLE_ROWS {
            debug!(
                data_source = data_source_id,
                rows = result.row_count,
                "cache write skipped: result too large"
            );
            return false;
        }
        if result.execution_time_ms > MAX_CACHEABLE_EXEC_MS {
            debug!(
                data_source = data_source_id,
                elapsed_ms = result.execution_time_ms,
                "cache write skipped: execution too slow to trust"
            );
            return false;
        }

        let key = cache_key(data_source_id, sql);
        let tables = referenced_tables(sql);
        let entry = CacheEntry {
            data_source_id: data_source_id.to_string(),
            columns: result.columns.clone(),
            rows: result.rows.clone(),
            row_count: result.row_count,
            cached_at: Instant::now(),
            ttl: compute_ttl(sql, result.execution_time_ms),
            tables: tables.clone(),
        };

        let mut inner = self.inner.write().unwrap();
        for table in &tables {
            inner
                .table_index
                .entry((data_source_id.to_string(), table.clone()))
                .or_default()
                .insert(key.clone());
        }
        inner.entries.insert(key, entry);
        true
    }

    /// Drop every entry belonging to a data source
    pub fn invalidate(&self, data_source_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner
            .entries
            .retain(|_, entry| entry.data_source_id != data_source_id);
        inner
            .table_index
            .retain(|(ds, _), _| ds != data_source_id);
    }

    /// Drop entries whose SQL referenced a table matching the hint
    /// (substring match on the indexed table name)
    pub fn invalidate_table(&self, data_source_id: &str, table_hint: &str) {
        let hint = table_hint.to_lowercase();
        let mut inner = self.inner.write().unwrap();
        let keys: Vec<String> = inner
            .table_index
            .iter()
            .filter(|((ds, table), _)| ds == data_source_id && table.contains(&hint))
            .flat_map(|(_, keys)| keys.iter().cloned())
            .collect();
        for key in &keys {
            inner.entries.remove(key);
        }
        inner.table_index.retain(|(ds, table), _| {
            !(ds == data_source_id && table.contains(&hint))
        });
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read().unwrap();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

fn remove_entry(inner: &mut CacheInner, data_source_id: &str, key: &str) {
    if let Some(entry) = inner.entries.remove(key) {
        for table in entry.tables {
            if let Some(keys) = inner
                .table_index
                .get_mut(&(data_source_id.to_string(), table))
            {
                keys.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sample_result(rows: usize, execution_time_ms: u64) -> QueryResult {
        let rows: Vec<serde_json::Map<String, serde_json::Value>> = (0..rows)
            .map(|i| {
                let mut m = serde_json::Map::new();
                m.insert("id".to_string(), serde_json::json!(i));
                m
            })
            .collect();
        QueryResult {
            columns: vec!["id".to_string()],
            row_count: rows.len(),
            rows,
            execution_time_ms,
            cached: false,
        }
    }

    #[rstest]
    #[case("SELECT NOW()", false)]
    #[case("SELECT RANDOM() * 10", false)]
    #[case("SELECT CURRENT_TIMESTAMP", false)]
    #[case("SELECT id FROM orders", true)]
    #[case("WITH t AS (SELECT 1 AS n) SELECT n FROM t", true)]
    #[case("DELETE FROM orders", false)]
    fn test_should_cache(#[case] sql: &str, #[case] expected: bool) {
        assert_eq!(should_cache(sql), expected, "{sql}");
    }

    #[test]
    fn test_round_trip_marks_cached_with_zero_time() {
        let cache = ResultCache::new(true);
        let result = sample_result(3, 42);
        assert!(cache.store("ds1", "SELECT id FROM orders", &result));

        let hit = cache.lookup("ds1", "select   id from orders;").unwrap();
        assert!(hit.cached);
        assert_eq!(hit.execution_time_ms, 0);
        assert_eq!(hit.rows, result.rows);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_lookup_is_scoped_per_data_source() {
        let cache = ResultCache::new(true);
        cache.store("ds1", "SELECT id FROM orders", &sample_result(1, 5));
        assert!(cache.lookup("ds2", "SELECT id FROM orders").is_none());
    }

    #[test]
    fn test_store_refusals() {
        let cache = ResultCache::new(true);
        assert!(!cache.store("ds1", "SELECT id FROM orders", &sample_result(0, 5)));
        assert!(!cache.store("ds1", "SELECT id FROM orders", &sample_result(10_001, 5)));
        assert!(!cache.store("ds1", "SELECT id FROM orders", &sample_result(5, 31_000)));
        assert!(!cache.store("ds1", "SELECT NOW()", &sample_result(5, 5)));
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_ttl_grows_with_execution_time() {
        let sql = "SELECT id FROM orders WHERE region = 'emea'";
        let fast = compute_ttl(sql, 200);
        let slow = compute_ttl(sql, 1_500);
        let slower = compute_ttl(sql, 6_000);
        assert!(fast <= slow && slow <= slower);
        assert_eq!(fast, Duration::from_secs(3600));
        assert_eq!(slow, Duration::from_secs(7200));
        assert_eq!(slower, Duration::from_secs(10_800));
        assert!(slower <= Duration::from_secs(6 * 3600));
    }

    #[test]
    fn test_mutable_intent_caps_ttl() {
        let ttl = compute_ttl("SELECT COUNT(*) FROM orders", 6_000);
        assert_eq!(ttl, Duration::from_secs(1800));
    }

    #[test]
    fn test_invalidate_by_table_hint() {
        let cache = ResultCache::new(true);
        cache.store("ds1", "SELECT id FROM orders", &sample_result(1, 5));
        cache.store(
            "ds1",
            "SELECT id FROM customers JOIN orders ON orders.customer_id = customers.id",
            &sample_result(1, 5),
        );
        cache.store("ds1", "SELECT id FROM invoices", &sample_result(1, 5));

        cache.invalidate_table("ds1", "orders");
        assert!(cache.lookup("ds1", "SELECT id FROM orders").is_none());
        assert!(
            cache
                .lookup(
                    "ds1",
                    "SELECT id FROM customers JOIN orders ON orders.customer_id = customers.id"
                )
                .is_none()
        );
        assert!(cache.lookup("ds1", "SELECT id FROM invoices").is_some());
    }

    #[test]
    fn test_invalidate_whole_data_source() {
        let cache = ResultCache::new(true);
        cache.store("ds1", "SELECT id FROM orders", &sample_result(1, 5));
        cache.store("ds2", "SELECT id FROM orders", &sample_result(1, 5));

        cache.invalidate("ds1");
        assert!(cache.lookup("ds1", "SELECT id FROM orders").is_none());
        assert!(cache.lookup("ds2", "SELECT id FROM orders").is_some());
    }

    #[test]
    fn test_referenced_tables_extraction() {
        let tables = referenced_tables(
            "SELECT c.name FROM public.customers c JOIN orders o ON o.customer_id = c.id",
        );
        assert_eq!(tables, vec!["customers".to_string(), "orders".to_string()]);
    }
}
