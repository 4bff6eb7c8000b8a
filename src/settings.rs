use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
    time::Duration,
};
use tokio::sync::watch;

use crate::models::Visibility;

const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8000";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    /// Fraction of each delay that is randomised, 0.0 disables jitter.
    pub jitter_ratio: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 5 * 60 * 1_000,
            max_attempts: 8,
            jitter_ratio: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatcherSettings {
    pub poll_interval_ms: u64,
    /// Minimum gap between the two equal-size observations that mark a file stable.
    pub stable_interval_ms: u64,
    pub reconcile_interval_secs: u64,
    pub root_retry_secs: u64,
    /// Files older than this when first listed are treated as already handled.
    pub backfill_window_hours: Option<u64>,
    pub extensions: Vec<String>,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            stable_interval_ms: 500,
            reconcile_interval_secs: 15,
            root_retry_secs: 5,
            backfill_window_hours: Some(24),
            extensions: vec!["png".into()],
        }
    }
}

impl WatcherSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn stable_interval(&self) -> Duration {
        Duration::from_millis(self.stable_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn root_retry_interval(&self) -> Duration {
        Duration::from_secs(self.root_retry_secs.max(1))
    }
}

/// In-game visibility selection over OSC. The game listens on `send_port`
/// and sends parameter changes to `recv_port`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OscSettings {
    pub enabled: bool,
    pub host: String,
    pub send_port: u16,
    pub recv_port: u16,
}

impl Default for OscSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".into(),
            send_port: 9000,
            recv_port: 9001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    pub server_url: String,
    pub watch_folder: Option<PathBuf>,
    /// Either a log file or the directory holding `output_log_*.txt` files.
    pub log_path: Option<PathBuf>,
    pub auto_upload: bool,
    pub jpeg_quality: u8,
    pub default_visibility: Visibility,
    pub retry: RetrySettings,
    pub worker_count: usize,
    pub watcher: WatcherSettings,
    pub log_poll_interval_ms: u64,
    pub request_timeout_secs: u64,
    /// How often a pipeline paused for a credential asks for one again.
    pub auth_recheck_secs: u64,
    pub shutdown_grace_secs: u64,
    pub status_log_interval_secs: u64,
    /// Tell the server which instance the player is in.
    pub report_presence: bool,
    pub osc: OscSettings,
    pub saved_token: Option<String>,
    pub data_dir: Option<PathBuf>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.into(),
            watch_folder: None,
            log_path: None,
            auto_upload: true,
            jpeg_quality: 85,
            default_visibility: Visibility::OnlyMe,
            retry: RetrySettings::default(),
            worker_count: 2,
            watcher: WatcherSettings::default(),
            log_poll_interval_ms: 1_000,
            request_timeout_secs: 60,
            auth_recheck_secs: 5,
            shutdown_grace_secs: 10,
            status_log_interval_secs: 60,
            report_presence: true,
            osc: OscSettings::default(),
            saved_token: None,
            data_dir: None,
        }
    }
}

impl AppSettings {
    /// Clamps out-of-range values instead of rejecting the whole file.
    fn sanitized(mut self) -> Self {
        if !(1..=100).contains(&self.jpeg_quality) {
            warn!(
                "jpeg_quality {} out of range 1-100, clamping",
                self.jpeg_quality
            );
            self.jpeg_quality = self.jpeg_quality.clamp(1, 100);
        }
        if self.worker_count == 0 {
            warn!("worker_count 0 is not usable, falling back to 1");
            self.worker_count = 1;
        }
        if self.retry.max_attempts == 0 {
            self.retry.max_attempts = 1;
        }
        self.retry.jitter_ratio = self.retry.jitter_ratio.clamp(0.0, 1.0);
        self.server_url = self.server_url.trim_end_matches('/').to_string();
        self
    }

    pub fn resolved_watch_folder(&self) -> PathBuf {
        if let Some(folder) = &self.watch_folder {
            return folder.clone();
        }
        let pictures = home_dir().join("Pictures");
        let vrchat = pictures.join("VRChat");
        if vrchat.exists() {
            vrchat
        } else {
            pictures
        }
    }

    pub fn resolved_log_path(&self) -> PathBuf {
        if let Some(path) = &self.log_path {
            return path.clone();
        }
        // The game writes its logs under LocalLow, a sibling of Roaming.
        match std::env::var_os("APPDATA") {
            Some(appdata) => PathBuf::from(appdata)
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(home_dir)
                .join("LocalLow")
                .join("VRChat")
                .join("VRChat"),
            None => home_dir()
                .join("AppData")
                .join("LocalLow")
                .join("VRChat")
                .join("VRChat"),
        }
    }

    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    pub fn log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.log_poll_interval_ms.max(50))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn auth_recheck_interval(&self) -> Duration {
        Duration::from_secs(self.auth_recheck_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn default_data_dir() -> PathBuf {
    std::env::var_os("SHOTSYNC_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(".shotsync"))
}

pub fn default_settings_path() -> PathBuf {
    std::env::var_os("SHOTSYNC_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| default_data_dir().join("settings.json"))
}

fn load(path: &Path) -> Result<AppSettings> {
    let data = if path.exists() {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        serde_json::from_str::<AppSettings>(&contents).unwrap_or_else(|err| {
            warn!(
                "Ignoring unreadable settings file {}: {err}",
                path.display()
            );
            AppSettings::default()
        })
    } else {
        AppSettings::default()
    };
    Ok(data.sanitized())
}

/// Read-mostly settings snapshot with a change hook. Persistence is a plain
/// JSON file next to the ledger.
pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<AppSettings>,
    changes: watch::Sender<AppSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = load(&path)?;
        let (changes, _) = watch::channel(data.clone());
        Ok(Self {
            path,
            data: RwLock::new(data),
            changes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> AppSettings {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Receiver that always holds the latest settings.
    pub fn subscribe(&self) -> watch::Receiver<AppSettings> {
        self.changes.subscribe()
    }

    pub fn update<F>(&self, apply: F) -> Result<AppSettings>
    where
        F: FnOnce(&mut AppSettings),
    {
        let updated = {
            let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
            let mut next = guard.clone();
            apply(&mut next);
            let next = next.sanitized();
            self.persist(&next)?;
            *guard = next.clone();
            next
        };
        self.changes.send_replace(updated.clone());
        Ok(updated)
    }

    /// Re-reads the file so hand edits reach a running process. Returns
    /// whether anything changed; subscribers are only notified if so.
    pub fn reload(&self) -> Result<bool> {
        let fresh = load(&self.path)?;
        let changed = {
            let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
            if *guard == fresh {
                false
            } else {
                *guard = fresh.clone();
                true
            }
        };
        if changed {
            self.changes.send_replace(fresh);
        }
        Ok(changed)
    }

    fn persist(&self, data: &AppSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory {}", parent.display())
            })?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
