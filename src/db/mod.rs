//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection pool management (primary plus replicas)
//! - Statement execution with timeouts
//! - Row decoding
//! - Database dispatch macros for reducing code duplication
//! - Tables owned by the operations layer

#[macro_use]
pub mod macros;
pub mod executor;
pub mod params;
pub mod pool;
pub mod records;
pub mod types;

pub use executor::QueryExecutor;
pub use pool::{DbPool, PoolSet};
