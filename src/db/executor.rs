//! Statement execution against a single pool.
//!
//! The executor uses database-specific implementations organized in submodules
//! (`postgres`, `sqlite`), each providing the same interface adapted to the
//! database's type system. Every call is bounded by a timeout.

use crate::db::params::{bind_postgres_param, bind_sqlite_param};
use crate::db::pool::DbPool;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{DEFAULT_QUERY_TIMEOUT_SECS, PoolRole, QueryParam, QueryResult};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;

/// Runs statements with a fixed timeout.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    default_timeout: Duration,
}

impl QueryExecutor {
    /// Create a new query executor with default settings.
    pub fn new() -> Self {
        Self {
            default_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
        }
    }

    /// Create a new query executor with a custom timeout.
    pub fn with_timeout(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run a statement and collect every returned row.
    ///
    /// Works for statements that return no rows too (plain INSERT/UPDATE).
    pub async fn fetch(
        &self,
        pool: &DbPool,
        role: PoolRole,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<QueryResult> {
        let start = Instant::now();

        debug!(
            pool = %role,
            sql = %sql,
            params = params.len(),
            timeout_secs = self.default_timeout.as_secs(),
            "Executing statement"
        );

        let (columns, rows) = match pool {
            DbPool::Postgres(p) => {
                let rows = postgres::fetch_rows(p, sql, params, self.default_timeout).await?;
                process_rows(rows)
            }
            DbPool::SQLite(p) => {
                let rows = sqlite::fetch_rows(p, sql, params, self.default_timeout).await?;
                process_rows(rows)
            }
        };

        Ok(QueryResult {
            columns,
            rows,
            execution_time_ms: start.elapsed().as_millis() as u64,
            served_by: role,
        })
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(&self, pool: &DbPool, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        debug!(sql = %sql, params = params.len(), "Executing write operation");

        match pool {
            DbPool::Postgres(p) => {
                postgres::execute_write(p, sql, params, self.default_timeout).await
            }
            DbPool::SQLite(p) => sqlite::execute_write(p, sql, params, self.default_timeout).await,
        }
    }
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

type JsonRow = serde_json::Map<String, serde_json::Value>;

/// Convert rows from any database type into column names and JSON maps.
fn process_rows<R: RowToJson>(rows: Vec<R>) -> (Vec<String>, Vec<JsonRow>) {
    let Some(first) = rows.first() else {
        return (Vec::new(), Vec::new());
    };
    let columns = first.get_column_names();
    let json_rows = rows.iter().map(RowToJson::to_json_map).collect();
    (columns, json_rows)
}

fn timeout_error(operation: &str, timeout: Duration) -> DbError {
    DbError::timeout(operation, timeout.as_secs() as u32)
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================

mod postgres {
    use super::*;
    use sqlx::PgPool;
    use sqlx::postgres::PgRow;

    pub async fn fetch_rows(
        pool: &PgPool,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<Vec<PgRow>> {
        // Without params use the simple protocol so utility statements work
        let result = if params.is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, pool.fetch_all(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_postgres_param(query, param);
            }
            timeout(query_timeout, query.fetch_all(pool)).await
        };

        match result {
            Ok(rows) => rows.map_err(DbError::from),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    pub async fn execute_write(
        pool: &PgPool,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<u64> {
        let result = if params.is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, pool.execute(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_postgres_param(query, param);
            }
            timeout(query_timeout, query.execute(pool)).await
        };

        match result {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}

mod sqlite {
    use super::*;
    use sqlx::SqlitePool;
    use sqlx::sqlite::SqliteRow;

    pub async fn fetch_rows(
        pool: &SqlitePool,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<Vec<SqliteRow>> {
        let result = if params.is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, pool.fetch_all(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_sqlite_param(query, param);
            }
            timeout(query_timeout, query.fetch_all(pool)).await
        };

        match result {
            Ok(rows) => rows.map_err(DbError::from),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    pub async fn execute_write(
        pool: &SqlitePool,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<u64> {
        let result = if params.is_empty() {
            use sqlx::Executor;
            timeout(query_timeout, pool.execute(sql)).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_sqlite_param(query, param);
            }
            timeout(query_timeout, query.execute(pool)).await
        };

        match result {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> DbPool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        DbPool::SQLite(pool)
    }

    #[test]
    fn test_executor_defaults() {
        let executor = QueryExecutor::new();
        assert_eq!(
            executor.timeout(),
            Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_executor_custom_timeout() {
        let executor = QueryExecutor::with_timeout(Duration::from_secs(5));
        assert_eq!(executor.timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_fetch_binds_params_and_tags_role() {
        let pool = memory_pool().await;
        let executor = QueryExecutor::new();
        executor
            .execute(
                &pool,
                "CREATE TABLE posts (id INTEGER PRIMARY KEY, title TEXT NOT NULL)",
                &[],
            )
            .await
            .unwrap();
        let affected = executor
            .execute(
                &pool,
                "INSERT INTO posts (title) VALUES (?), (?)",
                &["first".into(), "second".into()],
            )
            .await
            .unwrap();
        assert_eq!(affected, 2);

        let result = executor
            .fetch(
                &pool,
                PoolRole::Replica(3),
                "SELECT id, title FROM posts WHERE title = ?",
                &["second".into()],
            )
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["id", "title"]);
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.rows[0]["title"], "second");
        assert_eq!(result.served_by, PoolRole::Replica(3));
    }

    #[tokio::test]
    async fn test_fetch_empty_result_has_no_columns() {
        let pool = memory_pool().await;
        let executor = QueryExecutor::new();
        executor
            .execute(&pool, "CREATE TABLE tags (name TEXT)", &[])
            .await
            .unwrap();
        let result = executor
            .fetch(&pool, PoolRole::Primary, "SELECT name FROM tags", &[])
            .await
            .unwrap();
        assert_eq!(result.row_count(), 0);
        assert!(result.columns.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_missing_table_is_database_error() {
        let pool = memory_pool().await;
        let err = QueryExecutor::new()
            .fetch(&pool, PoolRole::Primary, "SELECT * FROM missing", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Database { .. }));
    }
}
