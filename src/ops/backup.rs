//! Scheduled backups and their rotation.

use crate::config::BackupSettings;
use crate::error::{DbError, DbResult};
use crate::metrics::MetricsSink;
use crate::models::{BackupKind, BackupRecord, BackupState, RetentionPolicy, RotationReport};
use crate::ops::dump::BackupDumper;
use crate::ops::retention::{identify_backups_to_retain, sort_newest_first};
use crate::ops::storage::BackupStore;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Outcome of planning a rotation over one listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationPlan {
    pub retained_full: usize,
    pub retained_incremental: usize,
    pub delete: Vec<String>,
}

/// Split the listing by kind and compute which keys go.
pub fn plan_rotation(
    records: Vec<BackupRecord>,
    full_policy: RetentionPolicy,
    incremental_policy: RetentionPolicy,
    now: DateTime<Utc>,
) -> RotationPlan {
    let (mut full, mut incremental): (Vec<_>, Vec<_>) = records
        .into_iter()
        .partition(|r| r.kind == BackupKind::Full);
    sort_newest_first(&mut full);
    sort_newest_first(&mut incremental);

    let keep_full = identify_backups_to_retain(&full, full_policy, now);
    let keep_incremental = identify_backups_to_retain(&incremental, incremental_policy, now);

    let delete = full
        .iter()
        .filter(|r| !keep_full.contains(&r.key))
        .chain(incremental.iter().filter(|r| !keep_incremental.contains(&r.key)))
        .map(|r| r.key.clone())
        .collect();

    RotationPlan {
        retained_full: keep_full.len(),
        retained_incremental: keep_incremental.len(),
        delete,
    }
}

/// Runs full and incremental backups and rotates old ones.
pub struct BackupManager {
    store: BackupStore,
    dumper: Arc<dyn BackupDumper>,
    settings: BackupSettings,
    states: RwLock<HashMap<BackupKind, BackupState>>,
    /// Start time of the last successful incremental backup
    last_incremental: RwLock<Option<DateTime<Utc>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl BackupManager {
    pub fn new(
        store: BackupStore,
        dumper: Arc<dyn BackupDumper>,
        settings: BackupSettings,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            dumper,
            settings,
            states: RwLock::new(HashMap::new()),
            last_incremental: RwLock::new(None),
            metrics,
        }
    }

    pub fn store(&self) -> &BackupStore {
        &self.store
    }

    /// Current state of the given backup kind.
    pub fn state(&self, kind: BackupKind) -> BackupState {
        self.states.read().get(&kind).cloned().unwrap_or_default()
    }

    pub async fn perform_full_backup(&self) -> DbResult<String> {
        self.perform_backup(BackupKind::Full).await
    }

    pub async fn perform_incremental_backup(&self) -> DbResult<String> {
        self.perform_backup(BackupKind::Incremental).await
    }

    /// Dump, upload and remove the local file. Returns the storage key.
    ///
    /// Failures are not retried; the next scheduled run tries again.
    pub async fn perform_backup(&self, kind: BackupKind) -> DbResult<String> {
        let started_at = Utc::now();
        self.set_state(kind, BackupState::Running { started_at });

        let file_name = kind.file_name(started_at);
        let local = self.settings.path.join(&file_name);
        let key = kind.storage_key(&file_name);

        match self.dump_and_upload(kind, &local, &key).await {
            Ok(size) => {
                if kind == BackupKind::Incremental {
                    *self.last_incremental.write() = Some(started_at);
                }
                self.set_state(
                    kind,
                    BackupState::Uploaded {
                        key: key.clone(),
                        at: Utc::now(),
                    },
                );
                self.metrics.increment(&format!("backup.{kind}.success"), 1);
                info!(kind = %kind, key = %key, size, "Backup completed");
                Ok(key)
            }
            Err(e) => {
                remove_local(&local).await;
                self.set_state(
                    kind,
                    BackupState::Failed {
                        reason: e.to_string(),
                        at: Utc::now(),
                    },
                );
                self.metrics.increment(&format!("backup.{kind}.error"), 1);
                error!(kind = %kind, error = %e, "Backup failed");
                Err(DbError::backup_failed(kind, e))
            }
        }
    }

    async fn dump_and_upload(&self, kind: BackupKind, local: &Path, key: &str) -> DbResult<u64> {
        tokio::fs::create_dir_all(&self.settings.path).await?;

        match kind {
            BackupKind::Full => self.dumper.full_dump(local).await?,
            BackupKind::Incremental => {
                let since = self.incremental_since().await;
                self.dumper.incremental_dump(local, since).await?
            }
        }

        let size = self.store.upload_file(key, local).await?;
        remove_local(local).await;
        Ok(size)
    }

    /// Start of the previous incremental backup. After a restart this is
    /// read from the newest stored incremental key.
    async fn incremental_since(&self) -> Option<DateTime<Utc>> {
        let known = *self.last_incremental.read();
        if known.is_some() {
            return known;
        }
        let records = match self.store.list().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Could not list stored backups; bundling the whole WAL archive");
                return None;
            }
        };
        let latest = records
            .iter()
            .filter_map(|r| BackupKind::Incremental.started_at_from_key(&r.key))
            .max();
        if let Some(at) = latest {
            info!(since = %at, "Resuming incremental backups from stored history");
            let mut last = self.last_incremental.write();
            if last.is_none() {
                *last = Some(at);
            }
        }
        latest
    }

    /// Delete every stored backup outside the retention policies.
    ///
    /// Only a failed listing fails the rotation; individual deletion failures
    /// are reported and counted.
    pub async fn rotate_backups(&self) -> DbResult<RotationReport> {
        let records = match self.store.list().await {
            Ok(records) => records,
            Err(e) => {
                self.metrics.increment("backup.rotation.error", 1);
                error!(error = %e, "Backup rotation failed");
                return Err(DbError::rotation_failed(e));
            }
        };

        let plan = plan_rotation(
            records,
            self.settings.retention_for(BackupKind::Full),
            self.settings.retention_for(BackupKind::Incremental),
            Utc::now(),
        );

        let results = join_all(plan.delete.iter().map(|key| async move {
            (key.clone(), self.store.delete(key).await)
        }))
        .await;

        let mut report = RotationReport {
            retained_full: plan.retained_full,
            retained_incremental: plan.retained_incremental,
            ..Default::default()
        };
        for (key, result) in results {
            match result {
                Ok(()) => {
                    self.metrics.increment("backup.deletion", 1);
                    report.deleted.push(key);
                }
                Err(e) => {
                    self.metrics.increment("backup.deletion.error", 1);
                    warn!(key = %key, error = %e, "Failed to delete backup");
                    report.failed.push((key, e.to_string()));
                }
            }
        }

        self.metrics.increment("backup.rotation.success", 1);
        info!(
            retained_full = report.retained_full,
            retained_incremental = report.retained_incremental,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Backup rotation completed"
        );
        Ok(report)
    }

    fn set_state(&self, kind: BackupKind, state: BackupState) {
        self.states.write().insert(kind, state);
    }
}

async fn remove_local(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove local backup file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn record(kind: BackupKind, at: DateTime<Utc>) -> BackupRecord {
        BackupRecord {
            key: kind.storage_key(&kind.file_name(at)),
            kind,
            last_modified: at,
            size: 10,
        }
    }

    #[test]
    fn test_plan_uses_policy_per_kind() {
        let now = Utc.with_ymd_and_hms(2026, 5, 20, 12, 0, 0).unwrap();
        let records: Vec<_> = (0..10)
            .flat_map(|d| {
                let at = now - Duration::days(d);
                [record(BackupKind::Full, at), record(BackupKind::Incremental, at)]
            })
            .collect();

        let plan = plan_rotation(
            records,
            RetentionPolicy::new(30, 12),
            RetentionPolicy::new(3, 1),
            now,
        );

        assert_eq!(plan.retained_full, 10);
        // Days 0..=2 by the daily rule; the May head is day 0
        assert_eq!(plan.retained_incremental, 3);
        assert_eq!(plan.delete.len(), 7);
        assert!(plan.delete.iter().all(|k| k.starts_with("incremental/")));
    }

    #[test]
    fn test_plan_on_empty_listing() {
        let plan = plan_rotation(
            Vec::new(),
            RetentionPolicy::new(30, 12),
            RetentionPolicy::new(7, 1),
            Utc::now(),
        );
        assert_eq!(plan, RotationPlan::default());
    }
}
