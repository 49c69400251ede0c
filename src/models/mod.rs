//! Data models for the database operations layer.
//!
//! This module re-exports all model types used throughout the crate.

pub mod audit;
pub mod backup;
pub mod connection;
pub mod query;
pub mod session;
pub mod suggestion;

// Re-export commonly used types
pub use audit::AuditRecord;
pub use backup::{BackupKind, BackupRecord, BackupState, RetentionPolicy, RotationReport};
pub use connection::{ConnectionConfig, ConnectionConfigError, DatabaseType, PoolRole};
pub use query::{DEFAULT_QUERY_TIMEOUT_SECS, QueryParam, QueryResult};
pub use session::{IdleConnection, RevocationReport};
pub use suggestion::{
    ColumnUsage, ExistingIndex, IndexSuggestion, IndexUsage, StatementStats, SuggestedAction,
    TableScanStats,
};
