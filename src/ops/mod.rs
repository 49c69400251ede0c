//! Operations components.
//!
//! - Replica-aware read/write routing and lag checks
//! - Full and incremental backups with retention-based rotation
//! - Index advice from PostgreSQL statistics
//! - Sensitive-data fingerprints, auditing and idle-session cleanup
//! - Tiered housekeeping
//! - The manager composing all of the above

pub mod backup;
pub mod column_usage;
pub mod dump;
pub mod maintenance;
pub mod manager;
pub mod optimizer;
pub mod replication;
pub mod retention;
pub mod security;
pub mod storage;

pub use backup::BackupManager;
pub use dump::{BackupDumper, PoolDumper};
pub use maintenance::{MaintenanceManager, MaintenanceReport, MaintenanceStep, MaintenanceTier};
pub use manager::{DatabaseManager, ManagerSettings};
pub use optimizer::QueryOptimizer;
pub use replication::{ReplicaLag, ReplicationRouter};
pub use security::SecurityManager;
pub use storage::BackupStore;
