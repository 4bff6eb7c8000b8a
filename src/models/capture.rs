//! Capture events emitted by the folder watcher.
//!
//! A `CaptureEvent` is only produced once a file has stopped growing, so the
//! size recorded here is the size the pipeline will read.

use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use chrono::{DateTime, Utc};

/// Detection instant on both clocks: `monotonic` for interval math inside the
/// process, `wall` for correlation with externally timestamped data.
#[derive(Debug, Clone, Copy)]
pub struct DetectedAt {
    pub monotonic: Instant,
    pub wall: DateTime<Utc>,
}

impl DetectedAt {
    pub fn now() -> Self {
        Self {
            monotonic: Instant::now(),
            wall: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureEvent {
    pub file_path: PathBuf,
    pub detected_at: DetectedAt,
    pub file_size_at_detection: u64,
    /// Filesystem modification time of the image, when the platform reports one.
    pub modified_at: Option<DateTime<Utc>>,
}

impl CaptureEvent {
    pub fn new(
        file_path: PathBuf,
        file_size_at_detection: u64,
        modified_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            file_path,
            detected_at: DetectedAt::now(),
            file_size_at_detection,
            modified_at,
        }
    }

    /// Timestamp used to look up the world/instance context. A screenshot is
    /// written in one go, so its modification time is the moment it was taken;
    /// detection can lag behind that by a reconciliation interval.
    pub fn capture_time(&self) -> DateTime<Utc> {
        self.modified_at.unwrap_or(self.detected_at.wall)
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "capture".to_string())
    }
}
