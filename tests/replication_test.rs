//! Integration tests for read/write routing.
//!
//! Each pool is its own SQLite file holding different data, so the pool that
//! answered a query can be read from the result.

use blogdb_ops::config::{PoolOptions, ReplicationSettings};
use blogdb_ops::db::{PoolSet, QueryExecutor};
use blogdb_ops::error::DbError;
use blogdb_ops::metrics::InMemoryMetrics;
use blogdb_ops::models::{ConnectionConfig, PoolRole, QueryParam};
use blogdb_ops::ops::ReplicationRouter;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn sqlite_config(role: PoolRole, dir: &TempDir) -> ConnectionConfig {
    let path = dir.path().join(format!("{role}.db"));
    ConnectionConfig::new(role, format!("sqlite:{}", path.display()), PoolOptions::default())
        .unwrap()
}

/// Open a primary and `replicas` replicas, each with a `whoami` table naming
/// itself. Replicas listed in `without_posts` get no `posts` table.
async fn setup(replicas: usize, without_posts: &[usize]) -> (TempDir, Arc<PoolSet>) {
    let dir = TempDir::new().unwrap();
    let primary = sqlite_config(PoolRole::Primary, &dir);
    let replica_configs: Vec<_> = (0..replicas)
        .map(|i| sqlite_config(PoolRole::Replica(i), &dir))
        .collect();
    let pools = PoolSet::open(&primary, &replica_configs, Duration::from_secs(5))
        .await
        .unwrap();

    let executor = QueryExecutor::new();
    let mut all = vec![(PoolRole::Primary, pools.primary())];
    all.extend(
        pools
            .replicas()
            .iter()
            .enumerate()
            .map(|(i, p)| (PoolRole::Replica(i), p)),
    );
    for (role, pool) in all {
        executor
            .execute(pool, "CREATE TABLE whoami (name TEXT NOT NULL)", &[])
            .await
            .unwrap();
        executor
            .execute(
                pool,
                "INSERT INTO whoami (name) VALUES (?)",
                &[QueryParam::from(role.to_string())],
            )
            .await
            .unwrap();
        let skip_posts = matches!(role, PoolRole::Replica(i) if without_posts.contains(&i));
        if !skip_posts {
            executor
                .execute(pool, "CREATE TABLE posts (id INTEGER PRIMARY KEY, title TEXT)", &[])
                .await
                .unwrap();
        }
    }

    (dir, Arc::new(pools))
}

fn router(pools: Arc<PoolSet>, metrics: Arc<InMemoryMetrics>) -> ReplicationRouter {
    let settings = ReplicationSettings {
        max_lag_secs: 300,
        query_timeout: Duration::from_secs(5),
    };
    ReplicationRouter::new(pools, &settings, metrics)
}

fn name_of(result: &blogdb_ops::models::QueryResult) -> String {
    match result.scalar() {
        Some(JsonValue::String(s)) => s.clone(),
        other => panic!("unexpected scalar: {other:?}"),
    }
}

#[tokio::test]
async fn test_reads_round_robin_over_replicas() {
    let (_dir, pools) = setup(2, &[]).await;
    let router = router(pools, InMemoryMetrics::shared());

    let mut served = Vec::new();
    for _ in 0..5 {
        let result = router.execute_read("SELECT name FROM whoami", &[]).await.unwrap();
        served.push(name_of(&result));
    }
    assert_eq!(
        served,
        vec!["replica-0", "replica-1", "replica-0", "replica-1", "replica-0"]
    );
}

#[tokio::test]
async fn test_read_without_replicas_uses_primary() {
    let (_dir, pools) = setup(0, &[]).await;
    let router = router(pools, InMemoryMetrics::shared());

    let result = router.execute_read("SELECT name FROM whoami", &[]).await.unwrap();
    assert_eq!(result.served_by, PoolRole::Primary);
    assert_eq!(name_of(&result), "primary");
}

#[tokio::test]
async fn test_failed_replica_read_falls_back_once() {
    let (_dir, pools) = setup(2, &[1]).await;
    let metrics = InMemoryMetrics::shared();
    let router = router(pools, metrics.clone());

    let first = router.execute_read("SELECT COUNT(*) FROM posts", &[]).await.unwrap();
    assert_eq!(first.served_by, PoolRole::Replica(0));

    let second = router.execute_read("SELECT COUNT(*) FROM posts", &[]).await.unwrap();
    assert_eq!(second.served_by, PoolRole::Primary);
    assert_eq!(metrics.counter("replica.fallback"), 1);
    assert_eq!(metrics.counter("write.error"), 0);
}

#[tokio::test]
async fn test_fallback_failure_surfaces_as_write_failure() {
    let (_dir, pools) = setup(1, &[]).await;
    let metrics = InMemoryMetrics::shared();
    let router = router(pools, metrics.clone());

    let err = router
        .execute_read("SELECT * FROM no_such_table", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::WriteFailed { .. }));
    assert_eq!(metrics.counter("replica.fallback"), 1);
    assert_eq!(metrics.counter("write.error"), 1);
}

#[tokio::test]
async fn test_writes_only_touch_primary() {
    let (_dir, pools) = setup(1, &[]).await;
    let metrics = InMemoryMetrics::shared();
    let router = router(Arc::clone(&pools), metrics.clone());

    router
        .execute_write(
            "INSERT INTO posts (title) VALUES (?)",
            &[QueryParam::from("hello")],
        )
        .await
        .unwrap();

    let executor = QueryExecutor::new();
    let on_primary = executor
        .fetch(pools.primary(), PoolRole::Primary, "SELECT COUNT(*) AS n FROM posts", &[])
        .await
        .unwrap();
    let on_replica = executor
        .fetch(
            &pools.replicas()[0],
            PoolRole::Replica(0),
            "SELECT COUNT(*) AS n FROM posts",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(on_primary.scalar(), Some(&JsonValue::from(1)));
    assert_eq!(on_replica.scalar(), Some(&JsonValue::from(0)));
}

#[tokio::test]
async fn test_write_failure_is_counted_and_wrapped() {
    let (_dir, pools) = setup(1, &[]).await;
    let metrics = InMemoryMetrics::shared();
    let router = router(pools, metrics.clone());

    let err = router
        .execute_write("INSERT INTO missing (x) VALUES (1)", &[])
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("Write query failed"));
    assert_eq!(metrics.counter("write.error"), 1);
}

#[tokio::test]
async fn test_lag_check_reports_every_replica() {
    let (_dir, pools) = setup(2, &[]).await;
    let metrics = InMemoryMetrics::shared();
    let router = router(pools, metrics.clone());

    let lags = router.check_replication_lag().await;
    assert_eq!(lags.len(), 2);
    assert!(lags.iter().all(|l| l.lag_secs == 0));
    assert_eq!(metrics.gauge_value("replica.1.lag"), Some(0.0));
    assert_eq!(metrics.counter("lag.check.error"), 0);
}
