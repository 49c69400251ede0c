//! Backend session models.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A backend session reported idle by `pg_stat_activity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleConnection {
    pub pid: i32,
    pub user: Option<String>,
    pub state: String,
    pub query_start: Option<DateTime<Utc>>,
}

impl IdleConnection {
    /// Time since the session's last query started, if it ever ran one.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.query_start.map(|start| now - start)
    }

    /// Whether the session has been idle for longer than `threshold`.
    pub fn is_idle_beyond(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.state == "idle" && self.idle_for(now).is_some_and(|idle| idle > threshold)
    }
}

/// Outcome of one idle-connection sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RevocationReport {
    /// Idle sessions seen, before the threshold filter
    pub examined: usize,
    pub terminated: Vec<i32>,
    pub failed: Vec<(i32, String)>,
}
