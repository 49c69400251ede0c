//! Backup retention rules.
//!
//! A backup is kept when its embedded date is within `daily` days of now, or
//! when it is the newest backup of one of the `monthly` most recent calendar
//! months. The retained set is the union of both rules.

use crate::models::{BackupRecord, RetentionPolicy};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use std::collections::HashSet;

/// First `YYYY-MM-DD` date embedded in a key.
pub fn embedded_date(key: &str) -> Option<NaiveDate> {
    let bytes = key.as_bytes();
    if bytes.len() < 10 {
        return None;
    }
    (0..=bytes.len() - 10).find_map(|start| {
        let window = &bytes[start..start + 10];
        let shaped = window.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        });
        if !shaped {
            return None;
        }
        std::str::from_utf8(window)
            .ok()
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    })
}

/// Order records newest first; ties on `last_modified` fall back to key order.
pub fn sort_newest_first(records: &mut [BackupRecord]) {
    records.sort_by(|a, b| {
        b.last_modified
            .cmp(&a.last_modified)
            .then_with(|| b.key.cmp(&a.key))
    });
}

/// Keys to keep from one backup group.
///
/// `records` must already be sorted newest first. Keys without an embedded
/// date match neither rule.
pub fn identify_backups_to_retain(
    records: &[BackupRecord],
    policy: RetentionPolicy,
    now: DateTime<Utc>,
) -> HashSet<String> {
    let mut retained = HashSet::new();
    let mut months_seen: Vec<(i32, u32)> = Vec::new();
    let daily_window_secs = i64::from(policy.daily) * 86_400;

    for record in records {
        let Some(date) = embedded_date(&record.key) else {
            continue;
        };
        let taken_at = date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());

        if let Some(taken_at) = taken_at {
            if (now - taken_at).num_seconds() <= daily_window_secs {
                retained.insert(record.key.clone());
            }
        }

        let month = (date.year(), date.month());
        if !months_seen.contains(&month) && months_seen.len() < policy.monthly as usize {
            months_seen.push(month);
            retained.insert(record.key.clone());
        }
    }

    retained
}
