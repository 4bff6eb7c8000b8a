//! Folder watcher: filesystem notifications for latency, a periodic
//! directory walk so missed notifications never lose a file, and a size
//! stability check before anything is emitted.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::{Instant, SystemTime},
};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::metrics::{Condition, StatusCollector};
use crate::models::CaptureEvent;
use crate::settings::WatcherSettings;

use super::state::WatchState;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

#[derive(Debug)]
struct FsChange {
    removed: bool,
    paths: Vec<PathBuf>,
}

/// Hands a notification to the watch loop. Once the loop has gone away the
/// failure is logged a single time; the periodic walk covers anything lost.
fn forward_change(
    changes: &mpsc::UnboundedSender<FsChange>,
    event: notify::Event,
    closed_reported: &mut bool,
) {
    let removed = matches!(event.kind, EventKind::Remove(_));
    let change = FsChange {
        removed,
        paths: event.paths,
    };
    if changes.send(change).is_err() && !*closed_reported {
        *closed_reported = true;
        log_debug!("watch loop gone, dropping filesystem notifications");
    }
}

#[derive(Debug, Clone)]
struct ScannedFile {
    path: PathBuf,
    size: u64,
    modified: Option<SystemTime>,
}

pub struct FolderWatcher {
    root: PathBuf,
    settings: WatcherSettings,
    state: WatchState,
    notifier: Option<RecommendedWatcher>,
}

impl FolderWatcher {
    pub fn new(root: PathBuf, settings: WatcherSettings) -> Self {
        let state = WatchState::new(settings.stable_interval());
        Self {
            root,
            settings,
            state,
            notifier: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn wants(&self, path: &Path) -> bool {
        has_extension(path, &self.settings.extensions)
    }

    /// Subscribes to notifications and takes the first inventory of the root.
    /// Existing files outside the backfill window are marked seen silently.
    async fn attach(&mut self, changes: mpsc::UnboundedSender<FsChange>) -> Result<()> {
        let mut closed_reported = false;
        let mut notifier = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => forward_change(&changes, event, &mut closed_reported),
                Err(err) => log_debug!("filesystem notification error: {err}"),
            }
        })
        .context("failed to create filesystem watcher")?;
        notifier
            .watch(&self.root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", self.root.display()))?;

        let files = self.scan().await?;
        let cutoff = self
            .settings
            .backfill_window_hours
            .and_then(|hours| {
                SystemTime::now()
                    .checked_sub(std::time::Duration::from_secs(hours.saturating_mul(3600)))
            });

        let now = Instant::now();
        let mut backfill = 0usize;
        for file in files {
            if self.state.is_tracked(&file.path) {
                continue;
            }
            let too_old = match (cutoff, file.modified) {
                (Some(cutoff), Some(modified)) => modified < cutoff,
                _ => false,
            };
            if too_old {
                self.state.mark_seen(&file.path);
            } else {
                backfill += 1;
                self.state
                    .observe(&file.path, file.size, file.modified.map(to_utc), now);
            }
        }

        log_info!(
            "watching {} ({} recent file(s) to consider)",
            self.root.display(),
            backfill
        );
        self.notifier = Some(notifier);
        Ok(())
    }

    fn detach(&mut self) {
        self.notifier = None;
    }

    async fn scan(&self) -> Result<Vec<ScannedFile>> {
        let root = self.root.clone();
        let extensions = self.settings.extensions.clone();
        tokio::task::spawn_blocking(move || scan_dir(&root, &extensions))
            .await
            .context("directory scan worker join failed")?
    }

    /// Re-stats every file that is still settling.
    pub(crate) async fn poll_candidates(&mut self, now: Instant) -> Vec<CaptureEvent> {
        let mut ready = Vec::new();
        for path in self.state.candidate_paths() {
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => {
                    let modified = meta.modified().ok().map(to_utc);
                    if let Some(event) = self.state.observe(&path, meta.len(), modified, now) {
                        ready.push(event);
                    }
                }
                _ => self.state.forget(&path),
            }
        }
        ready
    }

    /// Full walk of the root: starts tracking anything notifications missed
    /// and prunes entries for files that are gone.
    pub(crate) async fn reconcile(&mut self, now: Instant) -> Result<usize> {
        let files = self.scan().await?;
        let present: HashSet<PathBuf> = files.iter().map(|file| file.path.clone()).collect();

        let mut discovered = 0;
        for file in files {
            if !self.state.is_tracked(&file.path) {
                discovered += 1;
                self.state
                    .observe(&file.path, file.size, file.modified.map(to_utc), now);
            }
        }
        let pruned = self.state.prune(|path| present.contains(path));
        if discovered > 0 || pruned > 0 {
            log_debug!("reconcile: {discovered} new, {pruned} pruned");
        }
        Ok(discovered)
    }

    async fn on_change(&mut self, change: FsChange) {
        for path in change.paths {
            if !self.wants(&path) {
                continue;
            }
            if change.removed {
                self.state.forget(&path);
                continue;
            }
            if self.state.is_tracked(&path) {
                continue;
            }
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                if meta.is_file() {
                    let modified = meta.modified().ok().map(to_utc);
                    self.state.observe(&path, meta.len(), modified, Instant::now());
                }
            }
        }
    }

    async fn root_available(&self) -> bool {
        tokio::fs::metadata(&self.root)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }

    /// Emits stable captures on `events` until cancelled. A missing root puts
    /// the watcher in a retry state instead of ending the loop.
    pub async fn run(
        mut self,
        events: mpsc::UnboundedSender<CaptureEvent>,
        status: StatusCollector,
        cancel_token: CancellationToken,
    ) {
        let mut poll = tokio::time::interval(self.settings.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconcile = tokio::time::interval(self.settings.reconcile_interval());
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry = tokio::time::interval(self.settings.root_retry_interval());
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (changes_tx, mut changes_rx) = mpsc::unbounded_channel::<FsChange>();

        loop {
            if self.notifier.is_none() {
                tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => break,
                    _ = retry.tick() => {
                        match self.attach(changes_tx.clone()).await {
                            Ok(()) => {
                                if status.clear(Condition::WatchRootUnavailable).await {
                                    log_info!("watch root {} is back", self.root.display());
                                }
                                reconcile.reset();
                            }
                            Err(err) => {
                                if status.raise(Condition::WatchRootUnavailable).await {
                                    log_warn!("watch root unavailable, retrying every {:?}: {err:#}",
                                        self.settings.root_retry_interval());
                                }
                            }
                        }
                    }
                }
                continue;
            }

            let ready = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                Some(change) = changes_rx.recv() => {
                    self.on_change(change).await;
                    Vec::new()
                }
                _ = poll.tick() => {
                    if !self.root_available().await {
                        self.detach();
                        status.raise(Condition::WatchRootUnavailable).await;
                        log_warn!("watch root {} disappeared", self.root.display());
                        continue;
                    }
                    self.poll_candidates(Instant::now()).await
                }
                _ = reconcile.tick() => {
                    if let Err(err) = self.reconcile(Instant::now()).await {
                        log_warn!("reconcile of {} failed: {err:#}", self.root.display());
                    }
                    Vec::new()
                }
            };

            for event in ready {
                log_info!(
                    "capture ready: {} ({} bytes)",
                    event.file_path.display(),
                    event.file_size_at_detection
                );
                if events.send(event).is_err() {
                    log_info!("capture receiver closed, stopping watcher");
                    return;
                }
            }
        }

        log_info!("folder watcher shutting down");
    }
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|wanted| wanted.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

fn scan_dir(root: &Path, extensions: &[String]) -> Result<Vec<ScannedFile>> {
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                log_debug!("skipping unreadable entry under {}: {err}", root.display());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if !has_extension(entry.path(), extensions) {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        files.push(ScannedFile {
            path: entry.into_path(),
            size: meta.len(),
            modified: meta.modified().ok(),
        });
    }
    Ok(files)
}
