//! Sync execution and its log
//!
//! The [`SyncExecutor`] runs a mapping plan over a batch of records and writes
//! exactly one [`SyncLogEntry`] per run to the [`LogStore`].

pub mod executor;
pub mod log_store;

pub use executor::{RecordFailure, SyncExecutor, SyncReport};
pub use log_store::{LogQuery, LogStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall outcome of a run, derived from its counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Error,
    Partial,
}

/// Summary of one run, before the log store assigns id and timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDraft {
    pub plan_id: u64,
    pub plan_version: u32,
    pub source_connection_id: u64,
    pub target_connection_id: u64,
    pub record_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub partial: bool,
    pub error: Option<String>,
}

/// Immutable record of one sync run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub plan_id: u64,
    pub plan_version: u32,
    pub source_connection_id: u64,
    pub target_connection_id: u64,
    pub record_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    #[serde(default)]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncLogEntry {
    pub fn has_error(&self) -> bool {
        self.failure_count > 0 || self.error.is_some()
    }

    pub fn status(&self) -> SyncStatus {
        if self.partial {
            SyncStatus::Partial
        } else if self.has_error() {
            SyncStatus::Error
        } else {
            SyncStatus::Success
        }
    }
}

/// Query filter for the log store. All fields are optional and combine with AND.
/// `since` and `until` are both inclusive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogFilter {
    #[serde(default)]
    pub plan_id: Option<u64>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub has_error: Option<bool>,
}

impl LogFilter {
    pub fn for_plan(plan_id: u64) -> Self {
        Self {
            plan_id: Some(plan_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, entry: &SyncLogEntry) -> bool {
        self.plan_id.map_or(true, |id| entry.plan_id == id)
            && self.since.map_or(true, |t| entry.timestamp >= t)
            && self.until.map_or(true, |t| entry.timestamp <= t)
            && self.has_error.map_or(true, |e| entry.has_error() == e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(failures: u64, partial: bool) -> SyncLogEntry {
        SyncLogEntry {
            id: 1,
            timestamp: Utc::now(),
            plan_id: 3,
            plan_version: 1,
            source_connection_id: 1,
            target_connection_id: 2,
            record_count: 5,
            success_count: 5 - failures,
            failure_count: failures,
            partial,
            error: None,
        }
    }

    #[test]
    fn test_status() {
        assert_eq!(entry(0, false).status(), SyncStatus::Success);
        assert_eq!(entry(2, false).status(), SyncStatus::Error);
        assert_eq!(entry(0, true).status(), SyncStatus::Partial);
    }

    #[test]
    fn test_filter_matches() {
        let e = entry(1, false);
        assert!(LogFilter::default().matches(&e));
        assert!(LogFilter::for_plan(3).matches(&e));
        assert!(!LogFilter::for_plan(4).matches(&e));

        let errors_only = LogFilter {
            has_error: Some(true),
            ..Default::default()
        };
        assert!(errors_only.matches(&e));
        assert!(!errors_only.matches(&entry(0, false)));

        let future = LogFilter {
            since: Some(e.timestamp + Duration::seconds(1)),
            ..Default::default()
        };
        assert!(!future.matches(&e));

        let window = LogFilter {
            since: Some(e.timestamp),
            until: Some(e.timestamp),
            ..Default::default()
        };
        assert!(window.matches(&e));
    }

    #[test]
    fn test_entry_serialization() {
        let json = serde_json::to_string(&entry(0, false)).unwrap();
        assert!(json.contains("\"record_count\":5"));
        assert!(!json.contains("\"error\""));
    }
}
