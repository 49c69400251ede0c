//! Index advice from PostgreSQL statistics.
//!
//! Suggestions are advisory: they are logged and stored in
//! `index_suggestions`, never executed.

use crate::config::OptimizerThresholds;
use crate::db::{DbPool, PoolSet, records};
use crate::error::{DbError, DbResult};
use crate::metrics::MetricsSink;
use crate::models::{
    ColumnUsage, ExistingIndex, IndexSuggestion, IndexUsage, StatementStats, TableScanStats,
};
use crate::ops::column_usage::analyze_column_usage;
use chrono::Utc;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const TABLE_STATS_QUERY: &str = "SELECT relname AS table_name, seq_scan, seq_tup_read, \
     COALESCE(idx_scan, 0) AS idx_scan, n_live_tup \
     FROM pg_stat_user_tables \
     WHERE schemaname = 'public' AND seq_scan > 0 \
     ORDER BY seq_tup_read DESC";

const EXISTING_INDEXES_QUERY: &str = "SELECT tablename, indexname, indexdef \
     FROM pg_indexes WHERE schemaname = 'public'";

const UNUSED_INDEXES_QUERY: &str = "SELECT relname AS table_name, indexrelname AS index_name, idx_scan \
     FROM pg_stat_user_indexes \
     WHERE schemaname = 'public' AND idx_scan = 0 AND indexrelname NOT LIKE '%_pkey'";

const STATEMENT_STATS_QUERY: &str = "SELECT query, calls, mean_exec_time \
     FROM pg_stat_statements \
     WHERE query ILIKE '%' || $1 || '%' AND query ILIKE '%WHERE%'";

const TABLE_COLUMNS_QUERY: &str = "SELECT column_name::text FROM information_schema.columns \
     WHERE table_schema = 'public' AND table_name = $1";

/// Whether a table's scan profile warrants looking for missing indexes.
pub fn needs_index_review(stats: &TableScanStats, thresholds: &OptimizerThresholds) -> bool {
    stats.n_live_tup >= thresholds.min_live_rows
        && stats.seq_scan > 0
        && stats.seq_scan >= thresholds.seq_to_idx_ratio.saturating_mul(stats.idx_scan)
}

/// Create-index suggestions for one flagged table.
///
/// A column qualifies when its usage exceeds the threshold and no existing
/// index on the table leads with it. When `table_columns` is non-empty,
/// columns that do not belong to the table are ignored.
pub fn plan_create_suggestions(
    stats: &TableScanStats,
    usage: &[ColumnUsage],
    indexes: &[ExistingIndex],
    table_columns: &[String],
    thresholds: &OptimizerThresholds,
) -> Vec<IndexSuggestion> {
    usage
        .iter()
        .filter(|u| u.usage_count > thresholds.min_column_usage)
        .filter(|u| {
            table_columns.is_empty()
                || table_columns
                    .iter()
                    .any(|c| c.eq_ignore_ascii_case(&u.column_name))
        })
        .filter(|u| {
            !indexes
                .iter()
                .any(|idx| idx.table_name == stats.table_name && idx.covers(&u.column_name))
        })
        .map(|u| IndexSuggestion::create(&stats.table_name, &u.column_name, stats.seq_scan, u.usage_count))
        .collect()
}

/// Drop suggestions for never-scanned indexes, primary keys excluded.
pub fn plan_drop_suggestions(unused: &[IndexUsage]) -> Vec<IndexSuggestion> {
    unused
        .iter()
        .filter(|idx| idx.idx_scan == 0 && !idx.index_name.ends_with("_pkey"))
        .map(|idx| IndexSuggestion::drop_unused(&idx.table_name, &idx.index_name))
        .collect()
}

/// Produces and stores index suggestions.
pub struct QueryOptimizer {
    pools: Arc<PoolSet>,
    thresholds: OptimizerThresholds,
    metrics: Arc<dyn MetricsSink>,
}

impl QueryOptimizer {
    pub fn new(
        pools: Arc<PoolSet>,
        thresholds: OptimizerThresholds,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            pools,
            thresholds,
            metrics,
        }
    }

    pub fn thresholds(&self) -> &OptimizerThresholds {
        &self.thresholds
    }

    /// Analyze the primary's statistics and persist the resulting suggestions.
    pub async fn suggest_indexes(&self) -> DbResult<Vec<IndexSuggestion>> {
        let result = async {
            let suggestions = self.collect_suggestions().await?;
            records::insert_index_suggestions(self.pools.primary(), &suggestions, Utc::now())
                .await?;
            Ok::<_, DbError>(suggestions)
        }
        .await;

        match result {
            Ok(suggestions) => {
                self.metrics
                    .increment("optimization.index_suggestions.success", 1);
                for s in &suggestions {
                    info!(table = %s.table, suggestion = %s.suggestion_text(), reason = %s.reason, "Index suggestion");
                }
                info!(count = suggestions.len(), "Index analysis complete");
                Ok(suggestions)
            }
            Err(e) => {
                self.metrics.increment("optimization.index_suggestions.error", 1);
                error!(error = %e, "Index analysis failed");
                Err(e)
            }
        }
    }

    async fn collect_suggestions(&self) -> DbResult<Vec<IndexSuggestion>> {
        let DbPool::Postgres(pool) = self.pools.primary() else {
            return Err(DbError::unsupported("index suggestions", "SQLite"));
        };

        let tables = table_scan_stats(pool).await?;
        let indexes = existing_indexes(pool).await?;
        let mut suggestions = Vec::new();

        for stats in tables.iter().filter(|t| needs_index_review(t, &self.thresholds)) {
            debug!(
                table = %stats.table_name,
                seq_scan = stats.seq_scan,
                idx_scan = stats.idx_scan,
                "Reviewing table"
            );
            let statements = match statement_stats(pool, &stats.table_name).await {
                Ok(statements) => statements,
                Err(e) => {
                    warn!(table = %stats.table_name, error = %e, "Statement statistics unavailable");
                    continue;
                }
            };
            let usage = analyze_column_usage(&stats.table_name, &statements);
            let columns = table_columns(pool, &stats.table_name).await?;
            suggestions.extend(plan_create_suggestions(
                stats,
                &usage,
                &indexes,
                &columns,
                &self.thresholds,
            ));
        }

        suggestions.extend(plan_drop_suggestions(&unused_indexes(pool).await?));
        Ok(suggestions)
    }
}

async fn table_scan_stats(pool: &PgPool) -> DbResult<Vec<TableScanStats>> {
    let rows = sqlx::query(TABLE_STATS_QUERY).fetch_all(pool).await?;
    rows.iter()
        .map(|row| -> Result<TableScanStats, sqlx::Error> {
            Ok(TableScanStats {
                table_name: row.try_get("table_name")?,
                seq_scan: row.try_get("seq_scan")?,
                seq_tup_read: row.try_get("seq_tup_read")?,
                idx_scan: row.try_get("idx_scan")?,
                n_live_tup: row.try_get("n_live_tup")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(DbError::from)
}

async fn existing_indexes(pool: &PgPool) -> DbResult<Vec<ExistingIndex>> {
    let rows = sqlx::query(EXISTING_INDEXES_QUERY).fetch_all(pool).await?;
    rows.iter()
        .map(|row| -> Result<ExistingIndex, sqlx::Error> {
            Ok(ExistingIndex {
                table_name: row.try_get("tablename")?,
                index_name: row.try_get("indexname")?,
                index_def: row.try_get("indexdef")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(DbError::from)
}

async fn unused_indexes(pool: &PgPool) -> DbResult<Vec<IndexUsage>> {
    let rows = sqlx::query(UNUSED_INDEXES_QUERY).fetch_all(pool).await?;
    rows.iter()
        .map(|row| -> Result<IndexUsage, sqlx::Error> {
            Ok(IndexUsage {
                table_name: row.try_get("table_name")?,
                index_name: row.try_get("index_name")?,
                idx_scan: row.try_get("idx_scan")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(DbError::from)
}

/// Recorded statements mentioning `table`. Needs `pg_stat_statements`.
async fn statement_stats(pool: &PgPool, table: &str) -> DbResult<Vec<StatementStats>> {
    let rows = sqlx::query(STATEMENT_STATS_QUERY)
        .bind(table)
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| -> Result<StatementStats, sqlx::Error> {
            Ok(StatementStats {
                query: row.try_get("query")?,
                calls: row.try_get("calls")?,
                mean_time_ms: row.try_get("mean_exec_time")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(DbError::from)
}

async fn table_columns(pool: &PgPool, table: &str) -> DbResult<Vec<String>> {
    Ok(sqlx::query_scalar::<_, String>(TABLE_COLUMNS_QUERY)
        .bind(table)
        .fetch_all(pool)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(name: &str, seq_scan: i64, idx_scan: i64, live: i64) -> TableScanStats {
        TableScanStats {
            table_name: name.to_string(),
            seq_scan,
            seq_tup_read: seq_scan * 100,
            idx_scan,
            n_live_tup: live,
        }
    }

    fn usage(column: &str, count: i64) -> ColumnUsage {
        ColumnUsage {
            column_name: column.to_string(),
            usage_count: count,
            statement_count: 1,
            avg_time_ms: 1.0,
        }
    }

    fn index(table: &str, def: &str) -> ExistingIndex {
        ExistingIndex {
            table_name: table.to_string(),
            index_name: "idx".to_string(),
            index_def: def.to_string(),
        }
    }

    #[test]
    fn test_small_tables_are_never_reviewed() {
        let t = OptimizerThresholds::default();
        assert!(!needs_index_review(&stats("tags", 10_000, 0, 500), &t));
        assert!(needs_index_review(&stats("posts", 10_000, 0, 1000), &t));
    }

    #[test]
    fn test_ratio_boundary_is_inclusive() {
        let t = OptimizerThresholds::default();
        assert!(needs_index_review(&stats("posts", 300, 100, 5000), &t));
        assert!(!needs_index_review(&stats("posts", 299, 100, 5000), &t));
    }

    #[test]
    fn test_create_suggestions_skip_covered_and_rare_columns() {
        let t = OptimizerThresholds::default();
        let table = stats("posts", 5000, 10, 20_000);
        let suggestions = plan_create_suggestions(
            &table,
            &[usage("status", 400), usage("user_id", 900), usage("slug", 100)],
            &[
                index("posts", "CREATE INDEX idx ON public.posts USING btree (user_id)"),
                index("comments", "CREATE INDEX idx ON public.comments USING btree (status)"),
            ],
            &[],
            &t,
        );
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].column.as_deref(), Some("status"));
        assert_eq!(
            suggestions[0].suggestion_text(),
            "CREATE INDEX idx_posts_status ON posts (status)"
        );
    }

    #[test]
    fn test_create_suggestions_require_table_column() {
        let t = OptimizerThresholds::default();
        let table = stats("posts", 5000, 10, 20_000);
        let suggestions = plan_create_suggestions(
            &table,
            &[usage("status", 400), usage("email", 400)],
            &[],
            &["id".to_string(), "status".to_string()],
            &t,
        );
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].column.as_deref(), Some("status"));
    }

    #[test]
    fn test_drop_candidates_exclude_primary_keys() {
        let unused = vec![
            IndexUsage {
                table_name: "posts".to_string(),
                index_name: "posts_pkey".to_string(),
                idx_scan: 0,
            },
            IndexUsage {
                table_name: "posts".to_string(),
                index_name: "idx_posts_legacy".to_string(),
                idx_scan: 0,
            },
        ];
        let drops = plan_drop_suggestions(&unused);
        assert_eq!(drops.len(), 1);
        assert_eq!(drops[0].index.as_deref(), Some("idx_posts_legacy"));
        assert!(drops[0].is_drop());
    }
}
