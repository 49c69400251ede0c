//! Composition root for the operations layer.

use crate::config::{
    BackupSettings, Config, MaintenanceSettings, OptimizerThresholds, ReplicationSettings,
    SecuritySettings,
};
use crate::db::{PoolSet, records};
use crate::error::{DbError, DbResult};
use crate::metrics::MetricsSink;
use crate::models::{IndexSuggestion, QueryParam, QueryResult};
use crate::ops::backup::BackupManager;
use crate::ops::dump::{BackupDumper, PoolDumper};
use crate::ops::maintenance::{MaintenanceManager, MaintenanceTier};
use crate::ops::optimizer::QueryOptimizer;
use crate::ops::replication::ReplicationRouter;
use crate::ops::security::SecurityManager;
use crate::ops::storage::BackupStore;
use crate::scheduler::{Cadence, Scheduler};
use chrono::Weekday;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub const JOB_REPLICATION_LAG: &str = "replication_lag";
pub const JOB_FULL_BACKUP: &str = "full_backup";
pub const JOB_INCREMENTAL_BACKUP: &str = "incremental_backup";
pub const JOB_BACKUP_ROTATION: &str = "backup_rotation";
pub const JOB_INDEX_SUGGESTIONS: &str = "index_suggestions";
pub const JOB_IDLE_CONNECTIONS: &str = "idle_connections";
pub const JOB_MAINTENANCE_DAILY: &str = "maintenance_daily";
pub const JOB_MAINTENANCE_WEEKLY: &str = "maintenance_weekly";
pub const JOB_MAINTENANCE_MONTHLY: &str = "maintenance_monthly";

/// Settings for every component.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub replication: ReplicationSettings,
    pub backup: BackupSettings,
    pub security: SecuritySettings,
    pub maintenance: MaintenanceSettings,
    pub optimizer: OptimizerThresholds,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> DbResult<Self> {
        Ok(Self {
            replication: config.replication_settings(),
            backup: config.backup_settings(),
            security: config.security_settings(),
            maintenance: config.maintenance_settings().map_err(DbError::invalid_input)?,
            optimizer: OptimizerThresholds::default(),
        })
    }
}

/// Owns the pools and every operations component.
pub struct DatabaseManager {
    pools: Arc<PoolSet>,
    router: ReplicationRouter,
    backups: BackupManager,
    optimizer: QueryOptimizer,
    security: SecurityManager,
    maintenance: MaintenanceManager,
}

impl DatabaseManager {
    /// Open the pools described by `config` and build every component.
    pub async fn connect(config: &Config, metrics: Arc<dyn MetricsSink>) -> DbResult<Self> {
        let settings = ManagerSettings::from_config(config)?;
        let (primary, replicas) = config.parse_pools().map_err(DbError::invalid_input)?;
        let pools =
            Arc::new(PoolSet::open(&primary, &replicas, config.connect_timeout_duration()).await?);

        let built = async {
            let store = BackupStore::from_settings(&settings.backup)?;
            let dumper: Arc<dyn BackupDumper> = Arc::new(PoolDumper::new(
                pools.primary().clone(),
                primary.connection_string.clone(),
                settings.backup.wal_archive_dir.clone(),
            ));
            Self::new(Arc::clone(&pools), settings, store, dumper, metrics).await
        }
        .await;

        if built.is_err() {
            pools.close().await;
        }
        built
    }

    /// Build from open pools. Creates the operations tables if missing.
    pub async fn new(
        pools: Arc<PoolSet>,
        settings: ManagerSettings,
        store: BackupStore,
        dumper: Arc<dyn BackupDumper>,
        metrics: Arc<dyn MetricsSink>,
    ) -> DbResult<Self> {
        records::ensure_ops_tables(pools.primary()).await?;

        let manager = Self {
            router: ReplicationRouter::new(
                Arc::clone(&pools),
                &settings.replication,
                Arc::clone(&metrics),
            ),
            backups: BackupManager::new(store, dumper, settings.backup, Arc::clone(&metrics)),
            optimizer: QueryOptimizer::new(
                Arc::clone(&pools),
                settings.optimizer,
                Arc::clone(&metrics),
            ),
            security: SecurityManager::new(
                Arc::clone(&pools),
                &settings.security,
                Arc::clone(&metrics),
            )?,
            maintenance: MaintenanceManager::new(
                Arc::clone(&pools),
                settings.maintenance,
                Arc::clone(&metrics),
            )?,
            pools,
        };
        info!(
            replicas = manager.pools.replicas().len(),
            "Database manager initialized"
        );
        Ok(manager)
    }

    pub fn pools(&self) -> &Arc<PoolSet> {
        &self.pools
    }

    pub fn router(&self) -> &ReplicationRouter {
        &self.router
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn optimizer(&self) -> &QueryOptimizer {
        &self.optimizer
    }

    pub fn security(&self) -> &SecurityManager {
        &self.security
    }

    pub fn maintenance(&self) -> &MaintenanceManager {
        &self.maintenance
    }

    pub async fn execute_read(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        self.router.execute_read(sql, params).await
    }

    pub async fn execute_write(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        self.router.execute_write(sql, params).await
    }

    pub async fn suggest_indexes(&self) -> DbResult<Vec<IndexSuggestion>> {
        self.optimizer.suggest_indexes().await
    }

    pub fn encrypt_sensitive_data(&self, data: &str) -> String {
        self.security.encrypt_sensitive_data(data)
    }

    pub async fn audit_log_query(&self, query: &str, user_id: &str) -> DbResult<()> {
        self.security.audit_log_query(query, user_id).await
    }

    /// Register the recurring jobs on `scheduler`. All times are UTC.
    pub fn register_jobs(self: &Arc<Self>, scheduler: &mut Scheduler) {
        let m = Arc::clone(self);
        scheduler.register(
            JOB_REPLICATION_LAG,
            Cadence::every(Duration::from_secs(5 * 60)),
            move || {
                let m = Arc::clone(&m);
                async move {
                    m.router.check_replication_lag().await;
                    Ok(())
                }
            },
        );

        let m = Arc::clone(self);
        scheduler.register(JOB_FULL_BACKUP, Cadence::daily(1, 0), move || {
            let m = Arc::clone(&m);
            async move { m.backups.perform_full_backup().await.map(|_| ()) }
        });

        let m = Arc::clone(self);
        scheduler.register(
            JOB_INCREMENTAL_BACKUP,
            Cadence::every(Duration::from_secs(6 * 60 * 60)),
            move || {
                let m = Arc::clone(&m);
                async move { m.backups.perform_incremental_backup().await.map(|_| ()) }
            },
        );

        let m = Arc::clone(self);
        scheduler.register(
            JOB_BACKUP_ROTATION,
            Cadence::weekly(Weekday::Sun, 0, 0),
            move || {
                let m = Arc::clone(&m);
                async move { m.backups.rotate_backups().await.map(|_| ()) }
            },
        );

        let m = Arc::clone(self);
        scheduler.register(JOB_INDEX_SUGGESTIONS, Cadence::daily(3, 0), move || {
            let m = Arc::clone(&m);
            async move { m.optimizer.suggest_indexes().await.map(|_| ()) }
        });

        let m = Arc::clone(self);
        scheduler.register(
            JOB_IDLE_CONNECTIONS,
            Cadence::every(Duration::from_secs(60 * 60)),
            move || {
                let m = Arc::clone(&m);
                async move { m.security.revoke_idle_connections().await.map(|_| ()) }
            },
        );

        for (name, tier, cadence) in [
            (JOB_MAINTENANCE_DAILY, MaintenanceTier::Daily, Cadence::daily(2, 0)),
            (
                JOB_MAINTENANCE_WEEKLY,
                MaintenanceTier::Weekly,
                Cadence::weekly(Weekday::Sun, 1, 0),
            ),
            (
                JOB_MAINTENANCE_MONTHLY,
                MaintenanceTier::Monthly,
                Cadence::monthly(1, 0, 0),
            ),
        ] {
            let m = Arc::clone(self);
            scheduler.register(name, cadence, move || {
                let m = Arc::clone(&m);
                async move { m.maintenance.run_tier(tier).await.map(|_| ()) }
            });
        }
    }

    /// Final cleanup, a forced incremental backup, then pool closing.
    ///
    /// Pools are closed even when an earlier step fails; the error lists
    /// every failed step.
    pub async fn shutdown(&self) -> DbResult<()> {
        info!("Running shutdown cleanup");
        let mut failures = Vec::new();

        if let Err(e) = self.maintenance.perform_final_cleanup().await {
            error!(error = %e, "Final cleanup failed");
            failures.push(format!("final cleanup: {e}"));
        }
        if let Err(e) = self.backups.perform_incremental_backup().await {
            error!(error = %e, "Shutdown backup failed");
            failures.push(format!("incremental backup: {e}"));
        }
        self.pools.close().await;

        if failures.is_empty() {
            info!("Shutdown cleanup complete");
            Ok(())
        } else {
            Err(DbError::shutdown(failures.join("; ")))
        }
    }
}
