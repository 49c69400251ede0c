//! Read/write routing across the primary and its replicas.
//!
//! Writes always go to the primary. Reads rotate over the replicas and fall
//! back to the primary once when the chosen replica fails.

use crate::config::ReplicationSettings;
use crate::db::{DbPool, PoolSet, QueryExecutor};
use crate::error::{DbError, DbResult};
use crate::metrics::MetricsSink;
use crate::models::{PoolRole, QueryParam, QueryResult};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lag reported for a replica whose lag query failed.
pub const UNKNOWN_LAG: i64 = -1;

const PG_LAG_QUERY: &str = "SELECT EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp()))::FLOAT8";

/// Result of one replica's lag probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplicaLag {
    pub replica: usize,
    /// Whole seconds behind the primary, or [`UNKNOWN_LAG`]
    pub lag_secs: i64,
}

impl ReplicaLag {
    pub fn is_unknown(&self) -> bool {
        self.lag_secs == UNKNOWN_LAG
    }

    /// Lag strictly above `max_lag_secs`. Unknown lag never exceeds it.
    pub fn exceeds(&self, max_lag_secs: i64) -> bool {
        !self.is_unknown() && self.lag_secs > max_lag_secs
    }
}

/// Routes statements to the right pool.
pub struct ReplicationRouter {
    pools: Arc<PoolSet>,
    executor: QueryExecutor,
    max_lag_secs: i64,
    cursor: AtomicUsize,
    metrics: Arc<dyn MetricsSink>,
}

impl ReplicationRouter {
    pub fn new(
        pools: Arc<PoolSet>,
        settings: &ReplicationSettings,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            pools,
            executor: QueryExecutor::with_timeout(settings.query_timeout),
            max_lag_secs: settings.max_lag_secs,
            cursor: AtomicUsize::new(0),
            metrics,
        }
    }

    pub fn pools(&self) -> &Arc<PoolSet> {
        &self.pools
    }

    /// Run a statement on the primary.
    ///
    /// Any failure is counted as `write.error` and wrapped in
    /// [`DbError::WriteFailed`].
    pub async fn execute_write(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        match self
            .executor
            .fetch(self.pools.primary(), PoolRole::Primary, sql, params)
            .await
        {
            Ok(result) => Ok(result),
            Err(e) => {
                self.metrics.increment("write.error", 1);
                error!(error = %e, "Write query failed");
                Err(DbError::write_failed(e))
            }
        }
    }

    /// Run a read on the next replica, falling back to the primary once.
    ///
    /// Without replicas this is exactly [`execute_write`](Self::execute_write).
    pub async fn execute_read(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        let Some(idx) = self.next_replica() else {
            return self.execute_write(sql, params).await;
        };
        let role = PoolRole::Replica(idx);
        let pool = &self.pools.replicas()[idx];

        match self.executor.fetch(pool, role, sql, params).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.metrics.increment("replica.fallback", 1);
                warn!(replica = idx, error = %e, "Replica query failed, falling back to primary");
                self.execute_write(sql, params).await
            }
        }
    }

    /// Index of the replica that serves the next read.
    fn next_replica(&self) -> Option<usize> {
        let count = self.pools.replicas().len();
        if count == 0 {
            return None;
        }
        let previous = match self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| Some((i + 1) % count))
        {
            Ok(p) | Err(p) => p,
        };
        Some(previous % count)
    }

    /// Probe every replica's lag concurrently.
    ///
    /// Each lag is published as the `replica.<i>.lag` gauge. A failed probe
    /// yields [`UNKNOWN_LAG`] and counts `lag.check.error`; it never fails
    /// the whole check.
    pub async fn check_replication_lag(&self) -> Vec<ReplicaLag> {
        let timeout = self.executor.timeout();
        let probes = self
            .pools
            .replicas()
            .iter()
            .enumerate()
            .map(|(idx, pool)| async move {
                let lag_secs = match replica_lag(pool, timeout).await {
                    Ok(lag) => lag,
                    Err(e) => {
                        self.metrics.increment("lag.check.error", 1);
                        error!(replica = idx, error = %e, "Replication lag check failed");
                        UNKNOWN_LAG
                    }
                };
                ReplicaLag {
                    replica: idx,
                    lag_secs,
                }
            });

        let lags = join_all(probes).await;
        for lag in &lags {
            self.metrics
                .gauge(&format!("replica.{}.lag", lag.replica), lag.lag_secs as f64);
            if lag.exceeds(self.max_lag_secs) {
                warn!(
                    replica = lag.replica,
                    lag_secs = lag.lag_secs,
                    max_lag_secs = self.max_lag_secs,
                    "High replication lag"
                );
            } else {
                debug!(replica = lag.replica, lag_secs = lag.lag_secs, "Replication lag");
            }
        }
        if !lags.is_empty() {
            info!(replicas = lags.len(), "Replication lag check complete");
        }
        lags
    }
}

/// Seconds the replica is behind. SQLite replicas have no replication
/// stream, so a reachable one reports 0.
async fn replica_lag(pool: &DbPool, timeout: Duration) -> DbResult<i64> {
    let probe = async {
        let lag = impl_db_dispatch!(pool, {
            Postgres(p) => sqlx::query_scalar::<_, Option<f64>>(PG_LAG_QUERY)
                .fetch_one(p)
                .await?
                .map(|secs| secs.max(0.0).round() as i64)
                .unwrap_or(0),
            SQLite(p) => {
                sqlx::query_scalar::<_, i64>("SELECT 0").fetch_one(p).await?
            },
        });
        Ok::<_, DbError>(lag)
    };

    tokio::time::timeout(timeout, probe)
        .await
        .map_err(|_| DbError::timeout("replication lag check", timeout.as_secs() as u32))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> DbPool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        DbPool::SQLite(pool)
    }

    fn settings() -> ReplicationSettings {
        ReplicationSettings {
            max_lag_secs: 300,
            query_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_lag_threshold_is_strict() {
        let lag = |lag_secs| ReplicaLag { replica: 0, lag_secs };
        assert!(!lag(299).exceeds(300));
        assert!(!lag(300).exceeds(300));
        assert!(lag(301).exceeds(300));
        assert!(!lag(UNKNOWN_LAG).exceeds(-5));
    }

    #[tokio::test]
    async fn test_cursor_wraps_over_replicas() {
        let pools = PoolSet::new(
            memory_pool().await,
            vec![memory_pool().await, memory_pool().await, memory_pool().await],
        );
        let router = ReplicationRouter::new(Arc::new(pools), &settings(), InMemoryMetrics::shared());

        let picks: Vec<_> = (0..7).filter_map(|_| router.next_replica()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[tokio::test]
    async fn test_no_replicas_means_no_cursor() {
        let pools = PoolSet::new(memory_pool().await, Vec::new());
        let router = ReplicationRouter::new(Arc::new(pools), &settings(), InMemoryMetrics::shared());
        assert_eq!(router.next_replica(), None);
        assert!(router.check_replication_lag().await.is_empty());
    }

    #[tokio::test]
    async fn test_closed_replica_reports_unknown_lag() {
        let metrics = InMemoryMetrics::shared();
        let closed = memory_pool().await;
        closed.close().await;
        let pools = PoolSet::new(memory_pool().await, vec![memory_pool().await, closed]);
        let router = ReplicationRouter::new(Arc::new(pools), &settings(), metrics.clone());

        let lags = router.check_replication_lag().await;
        assert_eq!(lags.len(), 2);
        assert_eq!(lags[0].lag_secs, 0);
        assert!(lags[1].is_unknown());
        assert_eq!(metrics.counter("lag.check.error"), 1);
        assert_eq!(metrics.gauge_value("replica.1.lag"), Some(-1.0));
        assert_eq!(metrics.gauge_value("replica.0.lag"), Some(0.0));
    }
}
