use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Standing conditions that pause a stage until resolved externally.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    AuthRequired,
    UploadsDisabled,
    WatchRootUnavailable,
    LogUnavailable,
    ServerUnreachable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    pub at: DateTime<Utc>,
    pub file_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub pending: u64,
    pub in_flight: u64,
    pub retrying: u64,
    pub succeeded: u64,
    pub failed_permanent: u64,
    pub skipped_duplicates: u64,
    pub unreadable: u64,
    pub log_parse_failures: u64,
    pub conditions: Vec<Condition>,
    pub recent_failures: Vec<FailureRecord>,
}

impl StatusSnapshot {
    pub fn summary(&self) -> String {
        let mut line = format!(
            "pending={} in_flight={} retrying={} succeeded={} failed={} skipped={} unreadable={} log_parse_failures={}",
            self.pending,
            self.in_flight,
            self.retrying,
            self.succeeded,
            self.failed_permanent,
            self.skipped_duplicates,
            self.unreadable,
            self.log_parse_failures,
        );
        if !self.conditions.is_empty() {
            line.push_str(&format!(" conditions={:?}", self.conditions));
        }
        line
    }
}
