//! Blog Database Operations Library
//!
//! Operations layer for the blog backend's PostgreSQL cluster: replica-aware
//! routing, scheduled backups with rotation, index advice, auditing and
//! housekeeping.

pub mod config;
#[macro_use]
pub mod db;
pub mod error;
pub mod metrics;
pub mod models;
pub mod ops;
pub mod scheduler;

pub use config::Config;
pub use error::{DbError, DbResult};
pub use metrics::{InMemoryMetrics, MetricsSink, TracingMetrics};
pub use ops::DatabaseManager;
pub use scheduler::Scheduler;
