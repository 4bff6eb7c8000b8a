//! Stability tracking for files under the watch root, independent of any
//! notification mechanism.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

use crate::models::CaptureEvent;

#[derive(Debug, Clone, Copy)]
struct Candidate {
    size: u64,
    since: Instant,
}

/// Files still growing sit in `candidates`; files that were emitted or
/// deliberately ignored sit in `seen` until they disappear from disk.
#[derive(Debug)]
pub struct WatchState {
    candidates: HashMap<PathBuf, Candidate>,
    seen: HashSet<PathBuf>,
    stable_interval: Duration,
}

impl WatchState {
    pub fn new(stable_interval: Duration) -> Self {
        Self {
            candidates: HashMap::new(),
            seen: HashSet::new(),
            stable_interval,
        }
    }

    pub fn is_seen(&self, path: &Path) -> bool {
        self.seen.contains(path)
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.seen.contains(path) || self.candidates.contains_key(path)
    }

    /// Records a size observation. Emits once the size matched the previous
    /// observation and that observation is at least `stable_interval` old.
    pub fn observe(
        &mut self,
        path: &Path,
        size: u64,
        modified_at: Option<DateTime<Utc>>,
        now: Instant,
    ) -> Option<CaptureEvent> {
        if self.seen.contains(path) {
            return None;
        }

        match self.candidates.get_mut(path) {
            None => {
                self.candidates
                    .insert(path.to_path_buf(), Candidate { size, since: now });
                None
            }
            Some(candidate) if candidate.size != size => {
                *candidate = Candidate { size, since: now };
                None
            }
            Some(candidate) => {
                if size == 0 || now.saturating_duration_since(candidate.since) < self.stable_interval
                {
                    return None;
                }
                self.candidates.remove(path);
                self.seen.insert(path.to_path_buf());
                Some(CaptureEvent::new(path.to_path_buf(), size, modified_at))
            }
        }
    }

    /// Marks a file as handled without emitting it.
    pub fn mark_seen(&mut self, path: &Path) {
        self.candidates.remove(path);
        self.seen.insert(path.to_path_buf());
    }

    pub fn forget(&mut self, path: &Path) {
        self.candidates.remove(path);
        self.seen.remove(path);
    }

    pub fn candidate_paths(&self) -> Vec<PathBuf> {
        self.candidates.keys().cloned().collect()
    }

    /// Drops entries for files that no longer exist. Returns how many went.
    pub fn prune<F>(&mut self, exists: F) -> usize
    where
        F: Fn(&Path) -> bool,
    {
        let before = self.seen.len() + self.candidates.len();
        self.seen.retain(|path| exists(path));
        self.candidates.retain(|path, _| exists(path));
        before - (self.seen.len() + self.candidates.len())
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    pub fn clear(&mut self) {
        self.candidates.clear();
        self.seen.clear();
    }
}
