//! Audit trail records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One audited statement as stored in `audit_log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub query: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(query: impl Into<String>, user_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            query: query.into(),
            user_id: user_id.into(),
            timestamp,
        }
    }
}
