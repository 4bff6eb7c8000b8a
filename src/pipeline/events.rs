use std::path::PathBuf;

use serde::Serialize;
use uuid::Uuid;

use crate::metrics::Condition;
use crate::models::JobState;

/// Observations broadcast to UI consumers. Delivery is best-effort: a lagging
/// subscriber loses the oldest events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Queued {
        path: PathBuf,
    },
    SkippedDuplicate {
        path: PathBuf,
        fingerprint: String,
        /// Terminal ledger state, or `None` when the content is in flight.
        previous: Option<JobState>,
    },
    Started {
        job_id: Uuid,
        path: PathBuf,
        fingerprint: String,
    },
    Retrying {
        job_id: Uuid,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    Succeeded {
        job_id: Uuid,
        path: PathBuf,
        remote_id: Option<String>,
        attempts: u32,
    },
    Failed {
        job_id: Option<Uuid>,
        path: PathBuf,
        reason: String,
    },
    Paused {
        condition: Condition,
    },
    Resumed {
        condition: Condition,
    },
}
