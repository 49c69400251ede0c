//! Index advice data models.
//!
//! Statistics rows read from the PostgreSQL catalogs and the suggestions
//! derived from them.

use serde::{Deserialize, Serialize};

/// Scan counters for one table (`pg_stat_user_tables`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableScanStats {
    pub table_name: String,
    pub seq_scan: i64,
    pub seq_tup_read: i64,
    pub idx_scan: i64,
    pub n_live_tup: i64,
}

/// An index definition (`pg_indexes`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingIndex {
    pub table_name: String,
    pub index_name: String,
    /// e.g. `CREATE INDEX idx ON public.posts USING btree (user_id, category_id)`
    pub index_def: String,
}

impl ExistingIndex {
    /// Key columns in index order, unquoted and lowercased.
    pub fn key_columns(&self) -> Vec<String> {
        let Some(open) = self.index_def.find('(') else {
            return Vec::new();
        };
        let Some(close) = self.index_def.rfind(')') else {
            return Vec::new();
        };
        if close <= open {
            return Vec::new();
        }
        self.index_def[open + 1..close]
            .split(',')
            .filter_map(|part| part.split_whitespace().next())
            .map(|col| col.trim_matches('"').to_lowercase())
            .filter(|col| !col.is_empty())
            .collect()
    }

    /// Whether this index can serve lookups on `column`.
    pub fn covers(&self, column: &str) -> bool {
        self.key_columns()
            .first()
            .is_some_and(|leading| leading.eq_ignore_ascii_case(column))
    }
}

/// Scan counter for one index (`pg_stat_user_indexes`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexUsage {
    pub table_name: String,
    pub index_name: String,
    pub idx_scan: i64,
}

/// One normalized statement from `pg_stat_statements`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementStats {
    pub query: String,
    pub calls: i64,
    pub mean_time_ms: f64,
}

/// How often a column is filtered on by equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnUsage {
    pub column_name: String,
    /// Sum of `calls` across statements filtering on the column
    pub usage_count: i64,
    pub statement_count: usize,
    /// Call-weighted mean execution time
    pub avg_time_ms: f64,
}

/// What an index suggestion recommends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "statement", rename_all = "snake_case")]
pub enum SuggestedAction {
    CreateIndex(String),
    DropIndex(String),
}

/// Advisory recommendation to add or drop an index. Never applied automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSuggestion {
    pub table: String,
    pub column: Option<String>,
    pub index: Option<String>,
    pub reason: String,
    pub action: SuggestedAction,
}

impl IndexSuggestion {
    /// Suggest a single-column index.
    pub fn create(table: &str, column: &str, seq_scan: i64, usage_count: i64) -> Self {
        Self {
            table: table.to_string(),
            column: Some(column.to_string()),
            index: None,
            reason: format!(
                "High sequential scans ({}) with frequent filtering on this column ({} times)",
                seq_scan, usage_count
            ),
            action: SuggestedAction::CreateIndex(format!(
                "CREATE INDEX idx_{table}_{column} ON {table} ({column})"
            )),
        }
    }

    /// Flag an index that has never been scanned.
    pub fn drop_unused(table: &str, index: &str) -> Self {
        Self {
            table: table.to_string(),
            column: None,
            index: Some(index.to_string()),
            reason: "Index never used".to_string(),
            action: SuggestedAction::DropIndex(format!("Consider dropping: DROP INDEX {}", index)),
        }
    }

    /// Statement or action text as persisted.
    pub fn suggestion_text(&self) -> &str {
        match &self.action {
            SuggestedAction::CreateIndex(sql) | SuggestedAction::DropIndex(sql) => sql,
        }
    }

    pub fn is_drop(&self) -> bool {
        matches!(self.action, SuggestedAction::DropIndex(_))
    }
}
