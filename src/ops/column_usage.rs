//! Column usage extracted from recorded statement text.
//!
//! Statements come from `pg_stat_statements`, so literals are already
//! replaced by `$n` placeholders. A column counts as filtered when it appears
//! on one side of an `=` whose other side is not a column reference.

use crate::models::{ColumnUsage, StatementStats};
use sqlparser::ast::{BinaryOperator, Expr, ObjectName, Statement, visit_expressions, visit_relations};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::collections::{BTreeSet, HashMap};
use std::ops::ControlFlow;
use tracing::debug;

/// Parse a statement with the PostgreSQL dialect.
fn parse(sql: &str) -> Option<Vec<Statement>> {
    match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
        Ok(statements) => Some(statements),
        Err(e) => {
            debug!(error = %e, "Skipping statement that does not parse");
            None
        }
    }
}

fn column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        Expr::Nested(inner) => column_name(inner),
        _ => None,
    }
}

/// Whether any relation in the statements is `table` (schema ignored).
fn references_table(statements: &[Statement], table: &str) -> bool {
    statements.iter().any(|statement| {
        visit_relations(statement, |name: &ObjectName| {
            let rendered = name.to_string();
            let last = rendered.rsplit('.').next().unwrap_or_default();
            if last.trim_matches('"').eq_ignore_ascii_case(table) {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .is_break()
    })
}

/// Columns compared with `=` against a non-column expression.
fn equality_columns(statements: &[Statement]) -> BTreeSet<String> {
    let mut columns = BTreeSet::new();
    for statement in statements {
        let _ = visit_expressions(statement, |expr: &Expr| {
            if let Expr::BinaryOp {
                left,
                op: BinaryOperator::Eq,
                right,
            } = expr
            {
                match (column_name(left), column_name(right)) {
                    (Some(col), None) | (None, Some(col)) => {
                        columns.insert(col);
                    }
                    _ => {}
                }
            }
            ControlFlow::<()>::Continue(())
        });
    }
    columns
}

/// Equality-filtered columns of one statement, or `None` when it does not
/// parse or does not touch `table`.
pub fn filtered_columns(sql: &str, table: &str) -> Option<BTreeSet<String>> {
    let statements = parse(sql)?;
    references_table(&statements, table).then(|| equality_columns(&statements))
}

/// Aggregate usage per column over the statements that touch `table`.
///
/// `usage_count` is the sum of the statements' call counts and
/// `avg_time_ms` the call-weighted mean execution time. Sorted by usage,
/// highest first.
pub fn analyze_column_usage(table: &str, statements: &[StatementStats]) -> Vec<ColumnUsage> {
    struct Acc {
        calls: i64,
        statements: usize,
        weighted_time: f64,
    }

    let mut by_column: HashMap<String, Acc> = HashMap::new();
    for stat in statements {
        let Some(columns) = filtered_columns(&stat.query, table) else {
            continue;
        };
        let calls = stat.calls.max(0);
        for column in columns {
            let acc = by_column.entry(column).or_insert(Acc {
                calls: 0,
                statements: 0,
                weighted_time: 0.0,
            });
            acc.calls += calls;
            acc.statements += 1;
            acc.weighted_time += stat.mean_time_ms * calls as f64;
        }
    }

    let mut usage: Vec<ColumnUsage> = by_column
        .into_iter()
        .map(|(column_name, acc)| ColumnUsage {
            column_name,
            usage_count: acc.calls,
            statement_count: acc.statements,
            avg_time_ms: if acc.calls > 0 {
                acc.weighted_time / acc.calls as f64
            } else {
                0.0
            },
        })
        .collect();
    usage.sort_by(|a, b| {
        b.usage_count
            .cmp(&a.usage_count)
            .then_with(|| a.column_name.cmp(&b.column_name))
    });
    usage
}
