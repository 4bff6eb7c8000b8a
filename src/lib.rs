pub mod capture;
pub mod correlator;
pub mod db;
pub mod fingerprint;
pub mod grid;
pub mod imaging;
pub mod ledger;
pub mod metrics;
pub mod models;
pub mod osc;
pub mod pipeline;
pub mod presence;
pub mod settings;
pub mod upload;
mod utils;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use capture::WatcherController;
use correlator::{CorrelatorController, LogCorrelator, LogTailer, LogTimezone};
use db::Database;
use grid::GridMetadataExtractor;
use ledger::UploadLedger;
use metrics::StatusCollector;
use osc::OscController;
use pipeline::{log_ledger_summary, Pipeline, PipelineConfig, PipelineDeps};
use presence::PresenceController;
use settings::{default_settings_path, AppSettings, SettingsStore};
use upload::{AuthClient, ReqwestUploader, SettingsCredentialStore};

const SETTINGS_RELOAD_INTERVAL: Duration = Duration::from_secs(5);

pub fn run() -> Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    info!("shotsync starting up...");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("shotsync-worker")
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(serve())
}

async fn serve() -> Result<()> {
    let settings_store = Arc::new(SettingsStore::new(default_settings_path())?);
    let settings = settings_store.snapshot();
    info!("settings loaded from {}", settings_store.path().display());

    let database = Database::new(settings.resolved_data_dir().join("ledger.sqlite3"))?;
    let ledger = UploadLedger::new(database);
    if let Err(err) = log_ledger_summary(&ledger).await {
        warn!("could not summarize ledger: {err:#}");
    }

    let status = StatusCollector::new();
    let correlator = LogCorrelator::new(LogTimezone::Local)?;
    let uploader = Arc::new(ReqwestUploader::new(
        &settings.server_url,
        settings.request_timeout(),
    )?);
    info!("uploading to {}", uploader.endpoint());
    let auth: Arc<dyn AuthClient> =
        Arc::new(SettingsCredentialStore::new(Arc::clone(&settings_store)));

    let extractor = GridMetadataExtractor::default();
    info!("pose decoder: {}", extractor.decoder_name());

    let deps = PipelineDeps {
        ledger,
        correlator: correlator.clone(),
        extractor,
        transport: uploader.clone(),
        auth: Arc::clone(&auth),
        status: status.clone(),
    };

    let root_token = CancellationToken::new();
    let mut pipeline =
        Pipeline::start(deps, PipelineConfig::from_settings(&settings), &root_token).await;

    let (capture_tx, capture_rx) = mpsc::unbounded_channel();
    pipeline.attach_source(capture_rx);

    let mut watcher = WatcherController::new(capture_tx, status.clone());
    watcher.start(
        settings.resolved_watch_folder(),
        settings.watcher.clone(),
        &root_token,
    )?;

    let mut presence = PresenceController::new();
    if settings.report_presence {
        presence.start(
            correlator.subscribe_presence(),
            uploader,
            auth,
            &root_token,
        )?;
    }

    let mut osc = OscController::new();
    if settings.osc.enabled {
        if let Err(err) = osc
            .start(&settings.osc, Arc::clone(&settings_store), &root_token)
            .await
        {
            warn!("in-game visibility selection unavailable: {err:#}");
        }
    }

    let mut log_tail = CorrelatorController::new();
    log_tail.start(
        correlator,
        LogTailer::new(settings.resolved_log_path()),
        settings.log_poll_interval(),
        status.clone(),
        &root_token,
    )?;

    let mut settings_rx = settings_store.subscribe();
    let mut current = settings;

    let mut status_ticker =
        tokio::time::interval(Duration::from_secs(current.status_log_interval_secs.max(1)));
    status_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reload_ticker = tokio::time::interval(SETTINGS_RELOAD_INTERVAL);
    reload_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    error!("failed to listen for shutdown signal: {err}");
                }
                info!("shutdown requested");
                break;
            }
            _ = status_ticker.tick() => {
                info!("{}", pipeline.status().await.summary());
            }
            _ = reload_ticker.tick() => {
                if let Err(err) = settings_store.reload() {
                    warn!("settings reload failed: {err:#}");
                }
            }
            changed = settings_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = settings_rx.borrow_and_update().clone();
                apply_settings(&current, &next, &pipeline, &mut watcher, &root_token).await;
                current = next;
            }
        }
    }

    root_token.cancel();
    pipeline.shutdown(current.shutdown_grace()).await;
    if let Err(err) = watcher.stop().await {
        warn!("{err:#}");
    }
    if let Err(err) = log_tail.stop().await {
        warn!("{err:#}");
    }
    if let Err(err) = presence.stop().await {
        warn!("{err:#}");
    }
    if let Err(err) = osc.stop().await {
        warn!("{err:#}");
    }
    info!("shotsync stopped");
    Ok(())
}

async fn apply_settings(
    previous: &AppSettings,
    next: &AppSettings,
    pipeline: &Pipeline,
    watcher: &mut WatcherController,
    root_token: &CancellationToken,
) {
    pipeline
        .update_config(PipelineConfig::from_settings(next))
        .await;

    let root_changed = previous.resolved_watch_folder() != next.resolved_watch_folder();
    if root_changed || previous.watcher != next.watcher {
        let root = next.resolved_watch_folder();
        info!("watching {} from now on", root.display());
        if let Err(err) = watcher
            .restart(root, next.watcher.clone(), root_token)
            .await
        {
            error!("failed to restart folder watcher: {err:#}");
        }
    }

    if previous.server_url != next.server_url
        || previous.log_path != next.log_path
        || previous.osc != next.osc
        || previous.report_presence != next.report_presence
    {
        warn!("server_url, log_path, osc and report_presence changes take effect after restart");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::Visibility;

    #[tokio::test]
    async fn settings_change_reaches_pipeline_and_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let first_root = dir.path().join("shots");
        let second_root = dir.path().join("elsewhere");
        std::fs::create_dir_all(&first_root).unwrap();
        std::fs::create_dir_all(&second_root).unwrap();

        let store = Arc::new(SettingsStore::new(dir.path().join("settings.json")).unwrap());
        let previous = store
            .update(|s| s.watch_folder = Some(first_root.clone()))
            .unwrap();

        let status = StatusCollector::new();
        let deps = PipelineDeps {
            ledger: UploadLedger::new(Database::in_memory().unwrap()),
            correlator: LogCorrelator::new(LogTimezone::Local).unwrap(),
            extractor: GridMetadataExtractor::default(),
            transport: Arc::new(
                ReqwestUploader::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap(),
            ),
            auth: Arc::new(SettingsCredentialStore::new(Arc::clone(&store))),
            status: status.clone(),
        };
        let root_token = CancellationToken::new();
        let pipeline =
            Pipeline::start(deps, PipelineConfig::from_settings(&previous), &root_token).await;
        let (capture_tx, _capture_rx) = mpsc::unbounded_channel();
        let mut watcher = WatcherController::new(capture_tx, status);
        watcher
            .start(
                previous.resolved_watch_folder(),
                previous.watcher.clone(),
                &root_token,
            )
            .unwrap();
        assert_eq!(watcher.root(), Some(first_root.as_path()));

        let next = store
            .update(|s| {
                s.watch_folder = Some(second_root.clone());
                s.default_visibility = Visibility::Public;
                s.retry.max_attempts = 3;
                s.retry.base_delay_ms = 250;
            })
            .unwrap();
        apply_settings(&previous, &next, &pipeline, &mut watcher, &root_token).await;

        assert_eq!(watcher.root(), Some(second_root.as_path()));
        let config = pipeline.config();
        assert_eq!(config.visibility, Visibility::Public);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config, PipelineConfig::from_settings(&next));

        let paused = store.update(|s| s.auto_upload = false).unwrap();
        apply_settings(&next, &paused, &pipeline, &mut watcher, &root_token).await;
        assert_eq!(watcher.root(), Some(second_root.as_path()));
        assert!(!pipeline.config().auto_upload);

        root_token.cancel();
        pipeline.shutdown(Duration::from_millis(100)).await;
        watcher.stop().await.unwrap();
    }
}
