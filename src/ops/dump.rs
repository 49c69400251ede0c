//! Producing backup files from the primary.
//!
//! [`BackupDumper`] is the seam between the backup manager and the tools that
//! actually write dump files. [`PoolDumper`] is the production implementation.

use crate::db::DbPool;
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Writes full and incremental backup files to a local path.
#[async_trait]
pub trait BackupDumper: Send + Sync {
    /// Write a complete, compressed dump of the primary to `dest`.
    async fn full_dump(&self, dest: &Path) -> DbResult<()>;

    /// Write the changes since `since` (or everything available when `None`)
    /// to `dest`.
    async fn incremental_dump(&self, dest: &Path, since: Option<DateTime<Utc>>) -> DbResult<()>;
}

/// Dumps through the primary pool.
///
/// PostgreSQL full dumps shell out to `pg_dump`; incremental dumps switch the
/// WAL segment and bundle the archived segments. SQLite full dumps use
/// `VACUUM INTO`; SQLite has no incremental form.
pub struct PoolDumper {
    primary: DbPool,
    /// Connection string handed to `pg_dump`
    connection_string: String,
    wal_archive_dir: Option<PathBuf>,
}

impl PoolDumper {
    pub fn new(
        primary: DbPool,
        connection_string: impl Into<String>,
        wal_archive_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            primary,
            connection_string: connection_string.into(),
            wal_archive_dir,
        }
    }
}

#[async_trait]
impl BackupDumper for PoolDumper {
    async fn full_dump(&self, dest: &Path) -> DbResult<()> {
        match &self.primary {
            DbPool::Postgres(_) => pg_dump(&self.connection_string, dest).await,
            DbPool::SQLite(p) => {
                let target = dest.to_string_lossy().replace('\'', "''");
                sqlx::query(&format!("VACUUM INTO '{target}'"))
                    .execute(p)
                    .await?;
                Ok(())
            }
        }
    }

    async fn incremental_dump(&self, dest: &Path, since: Option<DateTime<Utc>>) -> DbResult<()> {
        let DbPool::Postgres(p) = &self.primary else {
            return Err(DbError::unsupported("incremental backup", "SQLite"));
        };
        let Some(wal_dir) = &self.wal_archive_dir else {
            return Err(DbError::invalid_input(
                "Incremental backups need a WAL archive directory (--wal-archive-dir)",
            ));
        };

        let segment: String = sqlx::query_scalar("SELECT pg_switch_wal()::text")
            .fetch_one(p)
            .await?;
        debug!(lsn = %segment, "Switched WAL segment");

        let bundled = bundle_wal_segments(wal_dir, dest, since).await?;
        info!(segments = bundled, dest = %dest.display(), "Bundled WAL segments");
        Ok(())
    }
}

async fn pg_dump(connection_string: &str, dest: &Path) -> DbResult<()> {
    let output = Command::new("pg_dump")
        .arg("--format=custom")
        .arg("--compress=9")
        .arg(format!("--file={}", dest.display()))
        .arg("--dbname")
        .arg(connection_string)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| DbError::io(format!("Failed to run pg_dump: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DbError::io(format!(
            "pg_dump exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

/// Concatenate archived WAL segments modified after `since` into `dest`.
///
/// Each entry is `u32 BE name length | name | u64 BE size | bytes`, in name
/// order. Returns the number of segments written.
pub async fn bundle_wal_segments(
    wal_dir: &Path,
    dest: &Path,
    since: Option<DateTime<Utc>>,
) -> DbResult<usize> {
    let mut entries = tokio::fs::read_dir(wal_dir).await.map_err(|e| {
        DbError::io(format!(
            "Cannot read WAL archive {}: {}",
            wal_dir.display(),
            e
        ))
    })?;

    let mut segments = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let modified: DateTime<Utc> = meta.modified()?.into();
        if since.is_some_and(|since| modified <= since) {
            continue;
        }
        segments.push(entry.path());
    }
    segments.sort();

    let mut out = tokio::fs::File::create(dest).await?;
    for path in &segments {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let data = tokio::fs::read(path).await?;
        out.write_u32(name.len() as u32).await?;
        out.write_all(name.as_bytes()).await?;
        out.write_u64(data.len() as u64).await?;
        out.write_all(&data).await?;
    }
    out.flush().await?;
    Ok(segments.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_bundle_layout() {
        let dir = TempDir::new().unwrap();
        let wal = dir.path().join("wal");
        tokio::fs::create_dir(&wal).await.unwrap();
        tokio::fs::write(wal.join("000000010000000000000002"), b"bb").await.unwrap();
        tokio::fs::write(wal.join("000000010000000000000001"), b"a").await.unwrap();

        let dest = dir.path().join("bundle.wal");
        let count = bundle_wal_segments(&wal, &dest, None).await.unwrap();
        assert_eq!(count, 2);

        let bytes = tokio::fs::read(&dest).await.unwrap();
        assert_eq!(&bytes[0..4], &24u32.to_be_bytes());
        assert_eq!(&bytes[4..28], b"000000010000000000000001");
        assert_eq!(&bytes[28..36], &1u64.to_be_bytes());
        assert_eq!(bytes[36], b'a');
        assert_eq!(bytes.len(), 2 * (4 + 24 + 8) + 3);
    }

    #[tokio::test]
    async fn test_bundle_skips_segments_before_since() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("seg"), b"a").await.unwrap();
        let dest = dir.path().join("out").with_extension("wal");
        let wal_dir = dir.path().to_path_buf();

        let future = Utc::now() + chrono::Duration::hours(1);
        let count = bundle_wal_segments(&wal_dir, &dest, Some(future)).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_missing_wal_dir_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = bundle_wal_segments(&dir.path().join("nope"), &dir.path().join("b"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Io { .. }));
    }

    #[tokio::test]
    async fn test_sqlite_full_dump_and_no_incremental() {
        let dir = TempDir::new().unwrap();
        // VACUUM INTO from an in-memory database never creates the file
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("src.db").display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE posts (id INTEGER PRIMARY KEY)")
            .execute(&pool)
            .await
            .unwrap();
        let dumper = PoolDumper::new(DbPool::SQLite(pool), url, None);

        let dest = dir.path().join("full.sql");
        dumper.full_dump(&dest).await.unwrap();
        assert!(dest.exists());

        let err = dumper
            .incremental_dump(&dir.path().join("inc.wal"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Unsupported { .. }));
    }
}
