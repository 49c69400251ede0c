//! Integration tests for the composed manager: auditing, fingerprints,
//! job registration and shutdown.

use async_trait::async_trait;
use blogdb_ops::config::{
    BackupSettings, MaintenanceSettings, OptimizerThresholds, PoolOptions, ReplicationSettings,
    SecuritySettings,
};
use blogdb_ops::db::{PoolSet, records};
use blogdb_ops::error::{DbError, DbResult};
use blogdb_ops::metrics::InMemoryMetrics;
use blogdb_ops::models::{BackupKind, ConnectionConfig, PoolRole, RetentionPolicy};
use blogdb_ops::ops::manager::{
    JOB_BACKUP_ROTATION, JOB_FULL_BACKUP, JOB_IDLE_CONNECTIONS, JOB_MAINTENANCE_MONTHLY,
    JOB_REPLICATION_LAG,
};
use blogdb_ops::ops::{BackupDumper, BackupStore, DatabaseManager, ManagerSettings};
use blogdb_ops::scheduler::{Cadence, Scheduler};
use chrono::{DateTime, Duration, Utc, Weekday};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct StubDumper {
    fail: bool,
}

#[async_trait]
impl BackupDumper for StubDumper {
    async fn full_dump(&self, dest: &Path) -> DbResult<()> {
        tokio::fs::write(dest, b"full").await?;
        Ok(())
    }

    async fn incremental_dump(&self, dest: &Path, _since: Option<DateTime<Utc>>) -> DbResult<()> {
        if self.fail {
            return Err(DbError::unsupported("incremental backup", "SQLite"));
        }
        tokio::fs::write(dest, b"wal").await?;
        Ok(())
    }
}

fn manager_settings(dir: &TempDir, key: &str) -> ManagerSettings {
    ManagerSettings {
        replication: ReplicationSettings {
            max_lag_secs: 300,
            query_timeout: std::time::Duration::from_secs(5),
        },
        backup: BackupSettings {
            path: dir.path().join("backups"),
            bucket: None,
            region: "us-east-1".to_string(),
            endpoint: None,
            full_retention: RetentionPolicy::new(30, 12),
            incremental_retention: RetentionPolicy::new(7, 1),
            wal_archive_dir: None,
        },
        security: SecuritySettings {
            encryption_key: key.to_string(),
            idle_threshold: Duration::minutes(60),
        },
        maintenance: MaintenanceSettings {
            tables: vec!["posts".to_string()],
            session_table: "sessions".to_string(),
            audit_retention: Duration::days(90),
            archive_rules: Vec::new(),
            archive_after: Duration::days(365),
            bloat_threshold: 0.2,
        },
        optimizer: OptimizerThresholds::default(),
    }
}

async fn build(
    dir: &TempDir,
    key: &str,
    fail_incremental: bool,
    metrics: Arc<InMemoryMetrics>,
) -> DbResult<DatabaseManager> {
    let primary = ConnectionConfig::new(
        PoolRole::Primary,
        format!("sqlite:{}", dir.path().join("blog.db").display()),
        PoolOptions::default(),
    )
    .unwrap();
    let pools = Arc::new(
        PoolSet::open(&primary, &[], std::time::Duration::from_secs(5))
            .await
            .unwrap(),
    );
    DatabaseManager::new(
        pools,
        manager_settings(dir, key),
        BackupStore::in_memory(),
        Arc::new(StubDumper {
            fail: fail_incremental,
        }),
        metrics,
    )
    .await
}

#[tokio::test]
async fn test_audit_log_is_persisted() {
    let dir = TempDir::new().unwrap();
    let manager = build(&dir, "secret", false, InMemoryMetrics::shared())
        .await
        .unwrap();

    manager
        .audit_log_query("DELETE FROM comments WHERE id = 7", "moderator-3")
        .await
        .unwrap();

    let audit = records::recent_audit_records(manager.pools().primary(), 5)
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].query, "DELETE FROM comments WHERE id = 7");
    assert_eq!(audit[0].user_id, "moderator-3");
}

#[tokio::test]
async fn test_fingerprints_are_deterministic_and_keyed() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let a = build(&dir_a, "key-one", false, InMemoryMetrics::shared())
        .await
        .unwrap();
    let b = build(&dir_b, "key-two", false, InMemoryMetrics::shared())
        .await
        .unwrap();

    let fp = a.encrypt_sensitive_data("reader@example.com");
    assert_eq!(fp, a.encrypt_sensitive_data("reader@example.com"));
    assert_eq!(fp.len(), 64);
    assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    assert_ne!(fp, b.encrypt_sensitive_data("reader@example.com"));
    assert_ne!(fp, a.encrypt_sensitive_data("other@example.com"));
}

#[tokio::test]
async fn test_empty_key_fails_construction() {
    let dir = TempDir::new().unwrap();
    let result = build(&dir, "", false, InMemoryMetrics::shared()).await;
    assert!(matches!(result, Err(DbError::InvalidInput { .. })));
}

#[tokio::test]
async fn test_optimizer_is_unsupported_on_sqlite() {
    let dir = TempDir::new().unwrap();
    let metrics = InMemoryMetrics::shared();
    let manager = build(&dir, "secret", false, metrics.clone()).await.unwrap();

    let err = manager.suggest_indexes().await.unwrap_err();
    assert!(matches!(err, DbError::Unsupported { .. }));
    assert_eq!(metrics.counter("optimization.index_suggestions.error"), 1);
}

#[tokio::test]
async fn test_register_jobs_uses_default_schedule() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(
        build(&dir, "secret", false, InMemoryMetrics::shared())
            .await
            .unwrap(),
    );
    let mut scheduler = Scheduler::new(InMemoryMetrics::shared());
    manager.register_jobs(&mut scheduler);

    assert_eq!(scheduler.job_names().len(), 9);
    assert_eq!(
        scheduler.cadence(JOB_REPLICATION_LAG),
        Some(Cadence::every(std::time::Duration::from_secs(300)))
    );
    assert_eq!(scheduler.cadence(JOB_FULL_BACKUP), Some(Cadence::daily(1, 0)));
    assert_eq!(
        scheduler.cadence(JOB_BACKUP_ROTATION),
        Some(Cadence::weekly(Weekday::Sun, 0, 0))
    );
    assert_eq!(
        scheduler.cadence(JOB_IDLE_CONNECTIONS),
        Some(Cadence::every(std::time::Duration::from_secs(3600)))
    );
    assert_eq!(
        scheduler.cadence(JOB_MAINTENANCE_MONTHLY),
        Some(Cadence::monthly(1, 0, 0))
    );

    // Manual trigger goes through the same job body
    let outcome = scheduler.trigger(JOB_FULL_BACKUP).unwrap();
    let blogdb_ops::scheduler::TickOutcome::Started(handle) = outcome else {
        panic!("full backup should start");
    };
    handle.await.unwrap();
    let stored = manager.backups().store().list().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].kind, BackupKind::Full);
}

#[tokio::test]
async fn test_shutdown_backs_up_and_closes_pools() {
    let dir = TempDir::new().unwrap();
    let metrics = InMemoryMetrics::shared();
    let manager = build(&dir, "secret", false, metrics.clone()).await.unwrap();

    manager.shutdown().await.unwrap();

    assert!(manager.pools().primary().is_closed());
    assert_eq!(metrics.counter("backup.incremental.success"), 1);
    let stored = manager.backups().store().list().await.unwrap();
    assert_eq!(stored[0].kind, BackupKind::Incremental);
}

#[tokio::test]
async fn test_shutdown_failure_still_closes_pools() {
    let dir = TempDir::new().unwrap();
    let manager = build(&dir, "secret", true, InMemoryMetrics::shared())
        .await
        .unwrap();

    let err = manager.shutdown().await.unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("incremental backup"));
    assert!(manager.pools().primary().is_closed());
}
