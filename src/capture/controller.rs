use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::info;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::StatusCollector;
use crate::models::CaptureEvent;
use crate::settings::WatcherSettings;

use super::watcher::FolderWatcher;

/// Owns the watch loop task. The event sender outlives restarts, so the
/// consumer sees one continuous sequence across root changes.
pub struct WatcherController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    root: Option<PathBuf>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    status: StatusCollector,
}

impl WatcherController {
    pub fn new(events: mpsc::UnboundedSender<CaptureEvent>, status: StatusCollector) -> Self {
        Self {
            handle: None,
            cancel_token: None,
            root: None,
            events,
            status,
        }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn start(
        &mut self,
        root: PathBuf,
        settings: WatcherSettings,
        parent: &CancellationToken,
    ) -> Result<()> {
        if self.handle.is_some() {
            bail!("folder watcher already active");
        }

        let cancel_token = parent.child_token();
        let watcher = FolderWatcher::new(root.clone(), settings);
        let handle = tokio::spawn(watcher.run(
            self.events.clone(),
            self.status.clone(),
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        self.root = Some(root);
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        self.root = None;

        if let Some(handle) = self.handle.take() {
            handle.await.context("folder watcher task failed to join")
        } else {
            Ok(())
        }
    }

    pub async fn restart(
        &mut self,
        root: PathBuf,
        settings: WatcherSettings,
        parent: &CancellationToken,
    ) -> Result<()> {
        info!("restarting folder watcher on {}", root.display());
        self.stop().await?;
        self.start(root, settings, parent)
    }
}
