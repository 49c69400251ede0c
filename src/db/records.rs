//! Tables owned by the operations layer and small housekeeping statements.
//!
//! `index_suggestions` and `audit_log` are created on startup if missing.
//! Table names passed in here must already be validated identifiers.

use crate::db::pool::DbPool;
use crate::error::DbResult;
use crate::models::{AuditRecord, IndexSuggestion};
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::debug;

const PG_CREATE_INDEX_SUGGESTIONS: &str = "CREATE TABLE IF NOT EXISTS index_suggestions (
    id BIGSERIAL PRIMARY KEY,
    timestamp TIMESTAMPTZ NOT NULL,
    table_name TEXT NOT NULL,
    suggestion TEXT NOT NULL,
    reason TEXT NOT NULL,
    implemented BOOLEAN NOT NULL DEFAULT FALSE
)";

const PG_CREATE_AUDIT_LOG: &str = "CREATE TABLE IF NOT EXISTS audit_log (
    id BIGSERIAL PRIMARY KEY,
    query TEXT NOT NULL,
    user_id TEXT NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL
)";

const SQLITE_CREATE_INDEX_SUGGESTIONS: &str = "CREATE TABLE IF NOT EXISTS index_suggestions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp DATETIME NOT NULL,
    table_name TEXT NOT NULL,
    suggestion TEXT NOT NULL,
    reason TEXT NOT NULL,
    implemented BOOLEAN NOT NULL DEFAULT 0
)";

const SQLITE_CREATE_AUDIT_LOG: &str = "CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    query TEXT NOT NULL,
    user_id TEXT NOT NULL,
    timestamp DATETIME NOT NULL
)";

/// Create `index_suggestions` and `audit_log` if they do not exist.
pub async fn ensure_ops_tables(pool: &DbPool) -> DbResult<()> {
    impl_db_dispatch!(pool, {
        Postgres(p) => {
            sqlx::query(PG_CREATE_INDEX_SUGGESTIONS).execute(p).await?;
            sqlx::query(PG_CREATE_AUDIT_LOG).execute(p).await?;
        },
        SQLite(p) => {
            sqlx::query(SQLITE_CREATE_INDEX_SUGGESTIONS).execute(p).await?;
            sqlx::query(SQLITE_CREATE_AUDIT_LOG).execute(p).await?;
        },
    });
    debug!("Operations tables ready");
    Ok(())
}

/// Persist one optimization run's suggestions in a single transaction.
///
/// Every row is stored with `implemented = false`. Returns the number of rows written.
pub async fn insert_index_suggestions(
    pool: &DbPool,
    suggestions: &[IndexSuggestion],
    at: DateTime<Utc>,
) -> DbResult<u64> {
    if suggestions.is_empty() {
        return Ok(0);
    }

    impl_db_dispatch!(pool, {
        Postgres(p) => {
            let mut tx = p.begin().await?;
            for s in suggestions {
                sqlx::query(
                    "INSERT INTO index_suggestions (timestamp, table_name, suggestion, reason, implemented) \
                     VALUES ($1, $2, $3, $4, FALSE)",
                )
                .bind(at)
                .bind(&s.table)
                .bind(s.suggestion_text())
                .bind(&s.reason)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        },
        SQLite(p) => {
            let mut tx = p.begin().await?;
            for s in suggestions {
                sqlx::query(
                    "INSERT INTO index_suggestions (timestamp, table_name, suggestion, reason, implemented) \
                     VALUES (?, ?, ?, ?, 0)",
                )
                .bind(at)
                .bind(&s.table)
                .bind(s.suggestion_text())
                .bind(&s.reason)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        },
    });
    Ok(suggestions.len() as u64)
}

/// Append an audit record.
pub async fn insert_audit_record(pool: &DbPool, record: &AuditRecord) -> DbResult<()> {
    impl_db_dispatch!(pool, {
        Postgres(p) => {
            sqlx::query("INSERT INTO audit_log (query, user_id, timestamp) VALUES ($1, $2, $3)")
                .bind(&record.query)
                .bind(&record.user_id)
                .bind(record.timestamp)
                .execute(p)
                .await?;
        },
        SQLite(p) => {
            sqlx::query("INSERT INTO audit_log (query, user_id, timestamp) VALUES (?, ?, ?)")
                .bind(&record.query)
                .bind(&record.user_id)
                .bind(record.timestamp)
                .execute(p)
                .await?;
        },
    });
    Ok(())
}

/// Most recent audit records first.
pub async fn recent_audit_records(pool: &DbPool, limit: i64) -> DbResult<Vec<AuditRecord>> {
    let rows = impl_db_dispatch!(pool, {
        Postgres(p) => sqlx::query(
            "SELECT query, user_id, timestamp FROM audit_log ORDER BY timestamp DESC, id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(p)
        .await?
        .iter()
        .map(|row| -> Result<AuditRecord, sqlx::Error> {
            Ok(AuditRecord {
                query: row.try_get("query")?,
                user_id: row.try_get("user_id")?,
                timestamp: row.try_get("timestamp")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?,
        SQLite(p) => sqlx::query(
            "SELECT query, user_id, timestamp FROM audit_log ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(p)
        .await?
        .iter()
        .map(|row| -> Result<AuditRecord, sqlx::Error> {
            Ok(AuditRecord {
                query: row.try_get("query")?,
                user_id: row.try_get("user_id")?,
                timestamp: row.try_get("timestamp")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?,
    });
    Ok(rows)
}

/// Delete audit records older than `cutoff`.
pub async fn prune_audit_log(pool: &DbPool, cutoff: DateTime<Utc>) -> DbResult<u64> {
    let result = impl_db_dispatch!(pool, {
        Postgres(p) => sqlx::query("DELETE FROM audit_log WHERE timestamp < $1")
            .bind(cutoff)
            .execute(p)
            .await?
            .rows_affected(),
        SQLite(p) => sqlx::query("DELETE FROM audit_log WHERE timestamp < ?")
            .bind(cutoff)
            .execute(p)
            .await?
            .rows_affected(),
    });
    Ok(result)
}

/// Whether a table exists (in `public` on PostgreSQL).
pub async fn table_exists(pool: &DbPool, table: &str) -> DbResult<bool> {
    let exists = impl_db_dispatch!(pool, {
        Postgres(p) => sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_name = $1)",
        )
        .bind(table)
        .fetch_one(p)
        .await?,
        SQLite(p) => sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_one(p)
        .await? > 0,
    });
    Ok(exists)
}

/// Delete rows of a session table whose `expires_at` is before `now`.
pub async fn delete_expired_sessions(
    pool: &DbPool,
    table: &str,
    now: DateTime<Utc>,
) -> DbResult<u64> {
    let deleted = impl_db_dispatch!(pool, {
        Postgres(p) => sqlx::query(&format!("DELETE FROM {table} WHERE expires_at < $1"))
            .bind(now)
            .execute(p)
            .await?
            .rows_affected(),
        SQLite(p) => sqlx::query(&format!("DELETE FROM {table} WHERE expires_at < ?"))
            .bind(now)
            .execute(p)
            .await?
            .rows_affected(),
    });
    Ok(deleted)
}
