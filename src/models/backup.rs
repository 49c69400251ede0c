//! Backup-related data models.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Kind of backup, which also decides its storage prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    pub const ALL: [BackupKind; 2] = [BackupKind::Full, BackupKind::Incremental];

    /// Storage prefix (without trailing slash).
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }

    /// Local file name for a backup taken at `at`.
    ///
    /// `full_backup_<ISO>.sql` or `incremental_<ISO>.wal`.
    pub fn file_name(&self, at: DateTime<Utc>) -> String {
        let timestamp = at.to_rfc3339_opts(SecondsFormat::Millis, true);
        match self {
            Self::Full => format!("full_backup_{}.sql", timestamp),
            Self::Incremental => format!("incremental_{}.wal", timestamp),
        }
    }

    /// Object storage key for a file name.
    pub fn storage_key(&self, file_name: &str) -> String {
        format!("{}/{}", self.prefix(), file_name)
    }

    /// Start time embedded in a key produced by [`storage_key`] and
    /// [`file_name`].
    ///
    /// [`storage_key`]: Self::storage_key
    /// [`file_name`]: Self::file_name
    pub fn started_at_from_key(&self, key: &str) -> Option<DateTime<Utc>> {
        let (stem, ext) = match self {
            Self::Full => ("full_backup_", ".sql"),
            Self::Incremental => ("incremental_", ".wal"),
        };
        let timestamp = key
            .strip_prefix(self.prefix())?
            .strip_prefix('/')?
            .strip_prefix(stem)?
            .strip_suffix(ext)?;
        DateTime::parse_from_rfc3339(timestamp)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Classify a stored key by its prefix.
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| key.starts_with(&format!("{}/", kind.prefix())))
    }
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A backup object as listed from storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub key: String,
    pub kind: BackupKind,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

/// How many backups of one kind survive a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep every backup dated within this many days
    pub daily: u32,
    /// Keep the newest backup of each of this many most recent months
    pub monthly: u32,
}

impl RetentionPolicy {
    pub const fn new(daily: u32, monthly: u32) -> Self {
        Self { daily, monthly }
    }
}

/// Lifecycle of the most recent run of one backup kind.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BackupState {
    #[default]
    Idle,
    Running {
        started_at: DateTime<Utc>,
    },
    Uploaded {
        key: String,
        at: DateTime<Utc>,
    },
    Failed {
        reason: String,
        at: DateTime<Utc>,
    },
}

/// Result of one rotation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RotationReport {
    pub retained_full: usize,
    pub retained_incremental: usize,
    pub deleted: Vec<String>,
    /// Keys whose deletion failed, with the reason
    pub failed: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_file_names_embed_iso_timestamp() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 1, 0, 0).unwrap();
        assert_eq!(
            BackupKind::Full.file_name(at),
            "full_backup_2026-03-04T01:00:00.000Z.sql"
        );
        assert_eq!(
            BackupKind::Incremental.file_name(at),
            "incremental_2026-03-04T01:00:00.000Z.wal"
        );
    }

    #[test]
    fn test_storage_key_and_classification() {
        let key = BackupKind::Full.storage_key("full_backup_x.sql");
        assert_eq!(key, "full/full_backup_x.sql");
        assert_eq!(BackupKind::from_key(&key), Some(BackupKind::Full));
        assert_eq!(
            BackupKind::from_key("incremental/a.wal"),
            Some(BackupKind::Incremental)
        );
        assert_eq!(BackupKind::from_key("fullish/a.sql"), None);
        assert_eq!(BackupKind::from_key("other.txt"), None);
    }

    #[test]
    fn test_started_at_from_key() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 6, 0, 0).unwrap();
        let key = BackupKind::Incremental.storage_key(&BackupKind::Incremental.file_name(at));
        assert_eq!(BackupKind::Incremental.started_at_from_key(&key), Some(at));
        assert_eq!(BackupKind::Full.started_at_from_key(&key), None);
        assert_eq!(
            BackupKind::Incremental.started_at_from_key("incremental/incremental_manual.wal"),
            None
        );
    }
}
