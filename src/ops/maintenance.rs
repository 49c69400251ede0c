//! Daily, weekly and monthly housekeeping.
//!
//! Each tier is a fixed list of steps. Every step runs even when an earlier
//! one failed; the tier fails if any step failed. Table names come from
//! validated configuration and are interpolated into DDL.

use crate::config::{MaintenanceSettings, validate_identifier};
use crate::db::{DbPool, PoolSet, QueryExecutor, records};
use crate::error::{DbError, DbResult};
use crate::metrics::MetricsSink;
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound for a single maintenance statement (VACUUM FULL can be slow).
const MAINTENANCE_STATEMENT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceTier {
    Daily,
    Weekly,
    Monthly,
}

impl MaintenanceTier {
    pub fn steps(&self) -> &'static [MaintenanceStep] {
        use MaintenanceStep::*;
        match self {
            Self::Daily => &[UpdateStatistics, CleanupTempTables, ExpireSessions],
            Self::Weekly => &[Reindex, Vacuum, PruneAuditLog],
            Self::Monthly => &[ArchiveData, CheckBloat],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

impl fmt::Display for MaintenanceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceStep {
    UpdateStatistics,
    CleanupTempTables,
    ExpireSessions,
    Reindex,
    Vacuum,
    PruneAuditLog,
    ArchiveData,
    CheckBloat,
}

impl MaintenanceStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateStatistics => "update_statistics",
            Self::CleanupTempTables => "cleanup_temp_tables",
            Self::ExpireSessions => "expire_sessions",
            Self::Reindex => "reindex",
            Self::Vacuum => "vacuum",
            Self::PruneAuditLog => "prune_audit_log",
            Self::ArchiveData => "archive_data",
            Self::CheckBloat => "check_bloat",
        }
    }
}

impl fmt::Display for MaintenanceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StepStatus {
    Completed(String),
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub step: MaintenanceStep,
    pub status: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub label: String,
    pub steps: Vec<StepOutcome>,
}

impl MaintenanceReport {
    pub fn failed_steps(&self) -> Vec<MaintenanceStep> {
        self.steps
            .iter()
            .filter(|o| matches!(o.status, StepStatus::Failed(_)))
            .map(|o| o.step)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.failed_steps().is_empty()
    }

    pub fn status(&self, step: MaintenanceStep) -> Option<&StepStatus> {
        self.steps.iter().find(|o| o.step == step).map(|o| &o.status)
    }

    /// `Err(Maintenance)` naming the failed steps, if any.
    pub fn into_result(self) -> DbResult<Self> {
        let failed = self.failed_steps();
        if failed.is_empty() {
            return Ok(self);
        }
        let names: Vec<_> = failed.iter().map(MaintenanceStep::as_str).collect();
        Err(DbError::maintenance(format!(
            "{} steps failed: {}",
            self.label,
            names.join(", ")
        )))
    }
}

/// Dead-tuple share of a table; 0 for an empty table.
pub fn bloat_ratio(live: i64, dead: i64) -> f64 {
    let total = live.max(0) + dead.max(0);
    if total == 0 {
        0.0
    } else {
        dead.max(0) as f64 / total as f64
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub struct MaintenanceManager {
    pools: Arc<PoolSet>,
    settings: MaintenanceSettings,
    executor: QueryExecutor,
    metrics: Arc<dyn MetricsSink>,
}

impl MaintenanceManager {
    pub fn new(
        pools: Arc<PoolSet>,
        settings: MaintenanceSettings,
        metrics: Arc<dyn MetricsSink>,
    ) -> DbResult<Self> {
        for table in settings
            .tables
            .iter()
            .chain(std::iter::once(&settings.session_table))
        {
            validate_identifier(table).map_err(DbError::invalid_input)?;
        }
        for (name, age) in [
            ("audit retention", settings.audit_retention),
            ("archive age", settings.archive_after),
        ] {
            if age <= chrono::Duration::zero() {
                return Err(DbError::invalid_input(format!("{name} must be positive")));
            }
        }
        Ok(Self {
            pools,
            settings,
            executor: QueryExecutor::with_timeout(MAINTENANCE_STATEMENT_TIMEOUT),
            metrics,
        })
    }

    pub fn settings(&self) -> &MaintenanceSettings {
        &self.settings
    }

    /// Run every step of a tier and record the tier outcome.
    pub async fn run(&self, tier: MaintenanceTier) -> MaintenanceReport {
        info!(tier = %tier, "Starting maintenance");
        let report = self.run_steps(tier.as_str(), tier.steps()).await;
        if report.is_success() {
            self.metrics
                .increment(&format!("maintenance.{tier}.success"), 1);
            info!(tier = %tier, "Maintenance completed");
        } else {
            self.metrics.increment(&format!("maintenance.{tier}.error"), 1);
            error!(tier = %tier, failed = ?report.failed_steps(), "Maintenance finished with failures");
        }
        report
    }

    /// [`run`](Self::run), failing when any step failed.
    pub async fn run_tier(&self, tier: MaintenanceTier) -> DbResult<MaintenanceReport> {
        self.run(tier).await.into_result()
    }

    /// Temp-table cleanup and session expiry, run once at shutdown.
    pub async fn perform_final_cleanup(&self) -> DbResult<MaintenanceReport> {
        self.run_steps(
            "final cleanup",
            &[MaintenanceStep::CleanupTempTables, MaintenanceStep::ExpireSessions],
        )
        .await
        .into_result()
    }

    async fn run_steps(&self, label: &str, steps: &[MaintenanceStep]) -> MaintenanceReport {
        let mut outcomes = Vec::with_capacity(steps.len());
        for &step in steps {
            let status = match self.run_step(step).await {
                Ok(status) => {
                    debug!(step = %step, status = ?status, "Maintenance step done");
                    status
                }
                Err(e) => {
                    self.metrics
                        .increment(&format!("maintenance.step.{step}.error"), 1);
                    error!(step = %step, error = %e, "Maintenance step failed");
                    StepStatus::Failed(e.to_string())
                }
            };
            outcomes.push(StepOutcome { step, status });
        }
        MaintenanceReport {
            label: label.to_string(),
            steps: outcomes,
        }
    }

    async fn run_step(&self, step: MaintenanceStep) -> DbResult<StepStatus> {
        match step {
            MaintenanceStep::UpdateStatistics => self.update_statistics().await,
            MaintenanceStep::CleanupTempTables => self.cleanup_temp_tables().await,
            MaintenanceStep::ExpireSessions => self.expire_sessions().await,
            MaintenanceStep::Reindex => self.reindex().await,
            MaintenanceStep::Vacuum => self.vacuum().await,
            MaintenanceStep::PruneAuditLog => self.prune_audit_log().await,
            MaintenanceStep::ArchiveData => self.archive_data().await,
            MaintenanceStep::CheckBloat => self.check_bloat().await,
        }
    }

    fn primary(&self) -> &DbPool {
        self.pools.primary()
    }

    async fn update_statistics(&self) -> DbResult<StepStatus> {
        for table in &self.settings.tables {
            self.executor
                .execute(self.primary(), &format!("ANALYZE {table}"), &[])
                .await?;
        }
        Ok(StepStatus::Completed(format!(
            "analyzed {} tables",
            self.settings.tables.len()
        )))
    }

    async fn cleanup_temp_tables(&self) -> DbResult<StepStatus> {
        let names: Vec<String> = impl_db_dispatch!(self.primary(), {
            Postgres(p) => sqlx::query_scalar(
                "SELECT tablename::text FROM pg_tables \
                 WHERE schemaname = 'public' AND tablename LIKE 'tmp\\_%'",
            )
            .fetch_all(p)
            .await?,
            SQLite(p) => sqlx::query_scalar(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name LIKE 'tmp\\_%' ESCAPE '\\'",
            )
            .fetch_all(p)
            .await?,
        });

        for name in &names {
            self.executor
                .execute(
                    self.primary(),
                    &format!("DROP TABLE IF EXISTS {}", quote_ident(name)),
                    &[],
                )
                .await?;
            debug!(table = %name, "Dropped temporary table");
        }
        Ok(StepStatus::Completed(format!(
            "dropped {} temporary tables",
            names.len()
        )))
    }

    async fn expire_sessions(&self) -> DbResult<StepStatus> {
        let table = &self.settings.session_table;
        if !records::table_exists(self.primary(), table).await? {
            return Ok(StepStatus::Skipped(format!("table {table} does not exist")));
        }
        let deleted = records::delete_expired_sessions(self.primary(), table, Utc::now()).await?;
        Ok(StepStatus::Completed(format!(
            "deleted {deleted} expired sessions"
        )))
    }

    async fn reindex(&self) -> DbResult<StepStatus> {
        for table in &self.settings.tables {
            let sql = match self.primary() {
                DbPool::Postgres(_) => format!("REINDEX TABLE {table}"),
                DbPool::SQLite(_) => format!("REINDEX {table}"),
            };
            self.executor.execute(self.primary(), &sql, &[]).await?;
        }
        Ok(StepStatus::Completed(format!(
            "reindexed {} tables",
            self.settings.tables.len()
        )))
    }

    async fn vacuum(&self) -> DbResult<StepStatus> {
        match self.primary() {
            DbPool::Postgres(_) => {
                for table in &self.settings.tables {
                    self.executor
                        .execute(self.primary(), &format!("VACUUM (FULL, ANALYZE) {table}"), &[])
                        .await?;
                }
                Ok(StepStatus::Completed(format!(
                    "vacuumed {} tables",
                    self.settings.tables.len()
                )))
            }
            DbPool::SQLite(_) => {
                self.executor.execute(self.primary(), "VACUUM", &[]).await?;
                Ok(StepStatus::Completed("vacuumed database".to_string()))
            }
        }
    }

    async fn prune_audit_log(&self) -> DbResult<StepStatus> {
        let cutoff = Utc::now() - self.settings.audit_retention;
        let pruned = records::prune_audit_log(self.primary(), cutoff).await?;
        Ok(StepStatus::Completed(format!("pruned {pruned} audit records")))
    }

    /// Move old rows of each archive rule's table into `<table>_archive`.
    async fn archive_data(&self) -> DbResult<StepStatus> {
        let cutoff = Utc::now() - self.settings.archive_after;
        let mut moved_total = 0u64;
        let mut archived_tables = 0usize;

        for rule in &self.settings.archive_rules {
            if !records::table_exists(self.primary(), &rule.table).await? {
                warn!(table = %rule.table, "Archive source table missing, skipping");
                continue;
            }
            let table = &rule.table;
            let column = &rule.timestamp_column;
            let archive = rule.archive_table();

            let moved = impl_db_dispatch!(self.primary(), {
                Postgres(p) => {
                    let mut tx = p.begin().await?;
                    sqlx::query(&format!(
                        "CREATE TABLE IF NOT EXISTS {archive} (LIKE {table} INCLUDING ALL)"
                    ))
                    .execute(&mut *tx)
                    .await?;
                    let moved = sqlx::query(&format!(
                        "INSERT INTO {archive} SELECT * FROM {table} WHERE {column} < $1"
                    ))
                    .bind(cutoff)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                    sqlx::query(&format!("DELETE FROM {table} WHERE {column} < $1"))
                        .bind(cutoff)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;
                    moved
                },
                SQLite(p) => {
                    let mut tx = p.begin().await?;
                    sqlx::query(&format!(
                        "CREATE TABLE IF NOT EXISTS {archive} AS SELECT * FROM {table} WHERE 0"
                    ))
                    .execute(&mut *tx)
                    .await?;
                    let moved = sqlx::query(&format!(
                        "INSERT INTO {archive} SELECT * FROM {table} WHERE {column} < ?"
                    ))
                    .bind(cutoff)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                    sqlx::query(&format!("DELETE FROM {table} WHERE {column} < ?"))
                        .bind(cutoff)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;
                    moved
                },
            });

            info!(table = %table, archive = %archive, rows = moved, "Archived old rows");
            moved_total += moved;
            archived_tables += 1;
        }

        Ok(StepStatus::Completed(format!(
            "archived {moved_total} rows from {archived_tables} tables"
        )))
    }

    async fn check_bloat(&self) -> DbResult<StepStatus> {
        let DbPool::Postgres(p) = self.primary() else {
            return Ok(StepStatus::Skipped(
                "dead-tuple statistics are not available on SQLite".to_string(),
            ));
        };

        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT relname::text, n_live_tup, n_dead_tup FROM pg_stat_user_tables \
             WHERE schemaname = 'public' AND relname::text = ANY($1)",
        )
        .bind(&self.settings.tables)
        .fetch_all(p)
        .await?;

        let mut bloated = 0usize;
        for (table, live, dead) in &rows {
            let ratio = bloat_ratio(*live, *dead);
            self.metrics
                .gauge(&format!("table.{table}.bloat_ratio"), ratio);
            if ratio > self.settings.bloat_threshold {
                bloated += 1;
                warn!(
                    table = %table,
                    ratio,
                    threshold = self.settings.bloat_threshold,
                    "Table bloat above threshold"
                );
            }
        }
        Ok(StepStatus::Completed(format!(
            "checked {} tables, {bloated} above threshold",
            rows.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_steps() {
        assert_eq!(
            MaintenanceTier::Daily.steps(),
            &[
                MaintenanceStep::UpdateStatistics,
                MaintenanceStep::CleanupTempTables,
                MaintenanceStep::ExpireSessions
            ]
        );
        assert_eq!(MaintenanceTier::Monthly.steps().len(), 2);
    }

    #[test]
    fn test_bloat_ratio() {
        assert_eq!(bloat_ratio(0, 0), 0.0);
        assert!((bloat_ratio(750, 250) - 0.25).abs() < f64::EPSILON);
        assert_eq!(bloat_ratio(-1, 0), 0.0);
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("tmp_x"), "\"tmp_x\"");
        assert_eq!(quote_ident("tmp\"x"), "\"tmp\"\"x\"");
    }

    #[test]
    fn test_report_into_result_names_failed_steps() {
        let report = MaintenanceReport {
            label: "weekly".to_string(),
            steps: vec![
                StepOutcome {
                    step: MaintenanceStep::Reindex,
                    status: StepStatus::Failed("boom".to_string()),
                },
                StepOutcome {
                    step: MaintenanceStep::Vacuum,
                    status: StepStatus::Completed("ok".to_string()),
                },
            ],
        };
        let err = report.into_result().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Maintenance failed: weekly steps failed: reindex"
        );
    }
}
