//! Schema Cache (C3): a TTL-bounded, singleflight-deduplicated snapshot of a
//! database's `pg_catalog` metadata, refreshed lazily on read.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nlsql_check::{CheckClient, DbSchema, load_schema_from_db};
use tokio::sync::{Mutex, RwLock};

use crate::error::ExecutionError;

/// An immutable point-in-time view of a database's schema, keyed by
/// `(schema, table)` for O(1) lookups from the validator.
#[derive(Debug, Clone)]
pub struct SchemaSnapshot {
    pub schema: Arc<DbSchema>,
    pub fetched_at: Instant,
}

impl SchemaSnapshot {
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    pub fn table(&self, schema: &str, table: &str) -> Option<&nlsql_check::TableInfo> {
        self.schema.find_table(schema, table)
    }
}

enum Slot {
    Ready(SchemaSnapshot),
    /// A refresh is in flight; followers await the same handle instead of
    /// issuing a redundant `pg_catalog` query (singleflight).
    Pending(Arc<Mutex<()>>),
}

/// Per-database TTL cache over [`SchemaSnapshot`]. A cache miss or expiry
/// triggers exactly one concurrent refresh; any readers that land mid-refresh
/// await its completion rather than issuing their own query.
pub struct SchemaCache {
    ttl: Duration,
    schemas: Vec<String>,
    slot: RwLock<Option<Slot>>,
}

impl SchemaCache {
    pub fn new(ttl: Duration, schemas: Vec<String>) -> Self {
        Self {
            ttl,
            schemas,
            slot: RwLock::new(None),
        }
    }

    /// Returns the current snapshot, refreshing it first if missing or
    /// stale. All concurrent callers during a refresh share its result.
    pub async fn get<C: CheckClient>(&self, client: &C) -> Result<SchemaSnapshot, ExecutionError> {
        if let Some(snapshot) = self.fresh_snapshot().await {
            return Ok(snapshot);
        }
        self.fetch(client, false).await
    }

    /// Unconditionally fetch a fresh snapshot and install it, ignoring any
    /// cached snapshot's age. Concurrent callers still share one fetch via
    /// the same singleflight slot.
    pub async fn refresh<C: CheckClient>(&self, client: &C) -> Result<SchemaSnapshot, ExecutionError> {
        self.fetch(client, true).await
    }

    async fn fresh_snapshot(&self) -> Option<SchemaSnapshot> {
        let guard = self.slot.read().await;
        match &*guard {
            Some(Slot::Ready(snapshot)) if snapshot.age() < self.ttl => Some(snapshot.clone()),
            _ => None,
        }
    }

    async fn fetch<C: CheckClient>(&self, client: &C, force: bool) -> Result<SchemaSnapshot, ExecutionError> {
        let own_lock = Arc::new(Mutex::new(()));
        let (lock, is_leader) = {
            let mut guard = self.slot.write().await;
            match &*guard {
                Some(Slot::Ready(snapshot)) if !force && snapshot.age() < self.ttl => {
                    return Ok(snapshot.clone());
                }
                Some(Slot::Pending(lock)) => (lock.clone(), false),
                _ => {
                    *guard = Some(Slot::Pending(own_lock.clone()));
                    (own_lock, true)
                }
            }
        };

        if !is_leader {
            // Another task is already fetching; wait for it to finish, then
            // re-read whatever snapshot it installed.
            let _ = lock.lock().await;
            let guard = self.slot.read().await;
            return match &*guard {
                Some(Slot::Ready(snapshot)) => Ok(snapshot.clone()),
                _ => Err(ExecutionError::SqlExecutionError(
                    "schema refresh leader failed to install a snapshot".to_string(),
                )),
            };
        }

        let _permit = lock.lock().await;
        let result = load_schema_from_db(client, &self.schemas).await;

        let mut guard = self.slot.write().await;
        match result {
            Ok(schema) => {
                let snapshot = SchemaSnapshot {
                    schema: Arc::new(schema),
                    fetched_at: Instant::now(),
                };
                *guard = Some(Slot::Ready(snapshot.clone()));
                Ok(snapshot)
            }
            Err(e) => {
                // Leave the cache empty so the next caller retries the fetch
                // rather than wedging on a permanently-pending slot.
                *guard = None;
                Err(ExecutionError::SqlExecutionError(e.to_string()))
            }
        }
    }

    /// Force the next `get` to refresh, discarding any cached snapshot.
    pub async fn invalidate(&self) {
        *self.slot.write().await = None;
    }
}

/// One [`SchemaCache`] per configured database.
pub struct SchemaCacheRegistry {
    caches: HashMap<crate::policy::DatabaseId, SchemaCache>,
}

impl SchemaCacheRegistry {
    pub fn new(caches: HashMap<crate::policy::DatabaseId, SchemaCache>) -> Self {
        Self { caches }
    }

    pub fn get(&self, db: &crate::policy::DatabaseId) -> Option<&SchemaCache> {
        self.caches.get(db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nlsql_check::DbSchema;
    use tokio_postgres::Row;

    struct FakeClient;

    #[async_trait::async_trait]
    impl CheckClient for FakeClient {
        async fn query(
            &self,
            _sql: &str,
            _params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
        ) -> nlsql_check::CheckResult<Vec<Row>> {
            // Not exercised: these unit tests only check cache timing logic
            // via a precomputed snapshot rather than a live `query` call.
            unreachable!("FakeClient::query is not used in timing tests")
        }

        async fn query_one(
            &self,
            _sql: &str,
            _params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
        ) -> nlsql_check::CheckResult<Row> {
            unreachable!("FakeClient::query_one is not used in timing tests")
        }

        async fn execute(
            &self,
            _sql: &str,
            _params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
        ) -> nlsql_check::CheckResult<u64> {
            unreachable!("FakeClient::execute is not used in timing tests")
        }
    }

    fn empty_schema() -> DbSchema {
        DbSchema {
            schemas: vec!["public".into()],
            tables: vec![],
        }
    }

    #[tokio::test]
    async fn snapshot_is_fresh_immediately_after_install() {
        let snapshot = SchemaSnapshot {
            schema: Arc::new(empty_schema()),
            fetched_at: Instant::now(),
        };
        assert!(snapshot.age() < Duration::from_millis(50));
        let _ = FakeClient;
    }
}
