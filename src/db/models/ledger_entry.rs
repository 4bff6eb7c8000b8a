//! Persisted upload ledger records.
//!
//! One row per content fingerprint. Terminal rows (`Succeeded`,
//! `FailedPermanent`) are never rewritten; `FailedRetryable` rows carry the
//! attempt count across restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::models::JobState;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub content_fingerprint: Fingerprint,
    pub last_state: JobState,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub file_path: Option<String>,
    pub remote_id: Option<String>,
    pub last_error: Option<String>,
}

impl LedgerEntry {
    pub fn new(content_fingerprint: Fingerprint, last_state: JobState) -> Self {
        Self {
            content_fingerprint,
            last_state,
            attempt_count: 0,
            last_attempt_at: None,
            file_path: None,
            remote_id: None,
            last_error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.last_state.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Written,
    /// An entry already sat in a terminal state and was left untouched.
    Unchanged,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateCounts {
    pub succeeded: u64,
    pub failed_permanent: u64,
    pub failed_retryable: u64,
}
