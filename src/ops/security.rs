//! Sensitive-data fingerprints, query auditing and idle-session cleanup.

use crate::config::SecuritySettings;
use crate::db::{DbPool, PoolSet, records};
use crate::error::{DbError, DbResult};
use crate::metrics::MetricsSink;
use crate::models::{AuditRecord, IdleConnection, RevocationReport};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::Row;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type HmacSha256 = Hmac<Sha256>;

const IDLE_SESSIONS_QUERY: &str = "SELECT pid, usename::text AS usename, state, query_start, now() AS observed_at \
     FROM pg_stat_activity \
     WHERE state = 'idle' AND datname = current_database() AND pid <> pg_backend_pid()";

/// Connections from `connections` idle for longer than `threshold` at `now`.
pub fn select_revocable(
    connections: &[IdleConnection],
    threshold: Duration,
    now: DateTime<Utc>,
) -> Vec<&IdleConnection> {
    connections
        .iter()
        .filter(|c| c.is_idle_beyond(threshold, now))
        .collect()
}

pub struct SecurityManager {
    pools: Arc<PoolSet>,
    mac: HmacSha256,
    idle_threshold: Duration,
    metrics: Arc<dyn MetricsSink>,
}

impl SecurityManager {
    pub fn new(
        pools: Arc<PoolSet>,
        settings: &SecuritySettings,
        metrics: Arc<dyn MetricsSink>,
    ) -> DbResult<Self> {
        if settings.encryption_key.is_empty() {
            return Err(DbError::invalid_input("Encryption key must not be empty"));
        }
        let mac = HmacSha256::new_from_slice(settings.encryption_key.as_bytes())
            .map_err(|e| DbError::invalid_input(format!("Invalid encryption key: {}", e)))?;
        Ok(Self {
            pools,
            mac,
            idle_threshold: settings.idle_threshold,
            metrics,
        })
    }

    /// Keyed, one-way fingerprint of `data` as lowercase hex HMAC-SHA256.
    ///
    /// Equal inputs give equal fingerprints under the same key; the input
    /// cannot be recovered.
    pub fn encrypt_sensitive_data(&self, data: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(data.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Append an audit record for `query` run by `user_id`.
    pub async fn audit_log_query(&self, query: &str, user_id: &str) -> DbResult<()> {
        let record = AuditRecord::new(query, user_id, Utc::now());
        records::insert_audit_record(self.pools.primary(), &record).await?;
        debug!(user = %user_id, "Query audited");
        Ok(())
    }

    /// Idle sessions on the primary's database, excluding this session.
    ///
    /// SQLite has no server sessions, so the list is always empty there.
    pub async fn list_idle_connections(&self) -> DbResult<(Vec<IdleConnection>, DateTime<Utc>)> {
        let DbPool::Postgres(pool) = self.pools.primary() else {
            return Ok((Vec::new(), Utc::now()));
        };

        let rows = sqlx::query(IDLE_SESSIONS_QUERY).fetch_all(pool).await?;
        let mut observed_at = Utc::now();
        let mut connections = Vec::with_capacity(rows.len());
        for row in &rows {
            observed_at = row.try_get("observed_at")?;
            connections.push(IdleConnection {
                pid: row.try_get("pid")?,
                user: row.try_get("usename")?,
                state: row
                    .try_get::<Option<String>, _>("state")?
                    .unwrap_or_default(),
                query_start: row.try_get("query_start")?,
            });
        }
        Ok((connections, observed_at))
    }

    /// Terminate every session idle beyond the threshold.
    ///
    /// A failed termination is logged and counted; the sweep continues.
    pub async fn revoke_idle_connections(&self) -> DbResult<RevocationReport> {
        let (connections, observed_at) = self.list_idle_connections().await?;
        let revocable = select_revocable(&connections, self.idle_threshold, observed_at);
        let mut report = RevocationReport {
            examined: connections.len(),
            ..Default::default()
        };

        let DbPool::Postgres(pool) = self.pools.primary() else {
            return Ok(report);
        };

        for conn in revocable {
            let result = sqlx::query_scalar::<_, bool>("SELECT pg_terminate_backend($1)")
                .bind(conn.pid)
                .fetch_one(pool)
                .await;
            match result {
                Ok(true) => {
                    self.metrics
                        .increment("security.idle_connections.terminated", 1);
                    info!(pid = conn.pid, user = ?conn.user, "Terminated idle connection");
                    report.terminated.push(conn.pid);
                }
                Ok(false) => {
                    self.metrics.increment("security.idle_connections.error", 1);
                    warn!(pid = conn.pid, "Idle connection could not be terminated");
                    report
                        .failed
                        .push((conn.pid, "pg_terminate_backend returned false".to_string()));
                }
                Err(e) => {
                    self.metrics.increment("security.idle_connections.error", 1);
                    error!(pid = conn.pid, error = %e, "Failed to terminate idle connection");
                    report.failed.push((conn.pid, e.to_string()));
                }
            }
        }

        info!(
            examined = report.examined,
            terminated = report.terminated.len(),
            failed = report.failed.len(),
            "Idle connection sweep complete"
        );
        Ok(report)
    }
}
