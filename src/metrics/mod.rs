//! Queryable pipeline status: job gauges, outcome counters and standing
//! conditions. Persistent failures surface here instead of as errors.

mod types;

pub use types::{Condition, FailureRecord, StatusSnapshot};

use std::{
    collections::{BTreeSet, VecDeque},
    sync::Arc,
};

use chrono::Utc;
use tokio::sync::Mutex;

const MAX_RECENT_FAILURES: usize = 20;

/// Terminal observation for a job that left the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    FailedPermanent { file_name: String, reason: String },
    SkippedDuplicate,
    Unreadable { file_name: String, reason: String },
    /// Dropped by shutdown before reaching a terminal state.
    Abandoned,
}

pub struct StatusCollector {
    inner: Arc<Mutex<StatusState>>,
}

#[derive(Default)]
struct StatusState {
    pending: u64,
    in_flight: u64,
    retrying: u64,
    succeeded: u64,
    failed_permanent: u64,
    skipped_duplicates: u64,
    unreadable: u64,
    log_parse_failures: u64,
    conditions: BTreeSet<Condition>,
    recent_failures: VecDeque<FailureRecord>,
}

impl StatusState {
    fn push_failure(&mut self, file_name: String, reason: String) {
        self.recent_failures.push_back(FailureRecord {
            at: Utc::now(),
            file_name,
            reason,
        });
        if self.recent_failures.len() > MAX_RECENT_FAILURES {
            self.recent_failures.pop_front();
        }
    }
}

impl Default for StatusCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatusState::default())),
        }
    }

    pub async fn job_queued(&self) {
        self.inner.lock().await.pending += 1;
    }

    pub async fn job_started(&self) {
        let mut state = self.inner.lock().await;
        state.pending = state.pending.saturating_sub(1);
        state.in_flight += 1;
    }

    /// Job is parked on a backoff timer or waiting for a credential.
    pub async fn job_parked(&self) {
        let mut state = self.inner.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
        state.retrying += 1;
    }

    /// A parked job went back on the queue.
    pub async fn job_requeued(&self) {
        let mut state = self.inner.lock().await;
        state.retrying = state.retrying.saturating_sub(1);
        state.pending += 1;
    }

    /// Queued job that never reached a worker.
    pub async fn queued_dropped(&self) {
        let mut state = self.inner.lock().await;
        state.pending = state.pending.saturating_sub(1);
    }

    /// Parked job dropped by shutdown.
    pub async fn parked_dropped(&self) {
        let mut state = self.inner.lock().await;
        state.retrying = state.retrying.saturating_sub(1);
    }

    pub async fn job_finished(&self, outcome: JobOutcome) {
        let mut state = self.inner.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
        match outcome {
            JobOutcome::Succeeded => state.succeeded += 1,
            JobOutcome::FailedPermanent { file_name, reason } => {
                state.failed_permanent += 1;
                state.push_failure(file_name, reason);
            }
            JobOutcome::SkippedDuplicate => state.skipped_duplicates += 1,
            JobOutcome::Unreadable { file_name, reason } => {
                state.unreadable += 1;
                state.push_failure(file_name, reason);
            }
            JobOutcome::Abandoned => {}
        }
    }

    pub async fn record_log_parse_failures(&self, count: u64) {
        self.inner.lock().await.log_parse_failures += count;
    }

    /// Returns true when the condition was not already standing.
    pub async fn raise(&self, condition: Condition) -> bool {
        self.inner.lock().await.conditions.insert(condition)
    }

    /// Returns true when the condition was standing.
    pub async fn clear(&self, condition: Condition) -> bool {
        self.inner.lock().await.conditions.remove(&condition)
    }

    pub async fn has(&self, condition: Condition) -> bool {
        self.inner.lock().await.conditions.contains(&condition)
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let state = self.inner.lock().await;
        StatusSnapshot {
            pending: state.pending,
            in_flight: state.in_flight,
            retrying: state.retrying,
            succeeded: state.succeeded,
            failed_permanent: state.failed_permanent,
            skipped_duplicates: state.skipped_duplicates,
            unreadable: state.unreadable,
            log_parse_failures: state.log_parse_failures,
            conditions: state.conditions.iter().copied().collect(),
            recent_failures: state.recent_failures.iter().cloned().collect(),
        }
    }
}

impl Clone for StatusCollector {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
