//! Bounded worker pool that drives each capture to a terminal state.
//!
//! Per capture: fingerprint and claim, context lookup, grid extraction and
//! JPEG conversion, then upload with retry. A claimed fingerprint stays
//! claimed while its job waits on a backoff timer, so re-emitted files are
//! skipped rather than uploaded twice.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::correlator::LogCorrelator;
use crate::db::LedgerEntry;
use crate::fingerprint::Fingerprint;
use crate::grid::GridMetadataExtractor;
use crate::imaging::{decode_capture, encode_jpeg, ConversionError};
use crate::ledger::{Claim, ClaimGuard, UploadLedger};
use crate::metrics::{Condition, JobOutcome, StatusCollector, StatusSnapshot};
use crate::models::{CaptureEvent, JobState, PoseMetadata, UploadJob, Visibility};
use crate::settings::AppSettings;
use crate::upload::{AuthClient, UploadError, UploadRequest, UploadTransport};

use super::backoff::RetryPolicy;
use super::events::PipelineEvent;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const EVENT_CAPACITY: usize = 256;
const LEDGER_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub worker_count: usize,
    pub auto_upload: bool,
    pub jpeg_quality: u8,
    pub visibility: Visibility,
    pub retry: RetryPolicy,
    pub auth_recheck: Duration,
}

impl PipelineConfig {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            worker_count: settings.worker_count.max(1),
            auto_upload: settings.auto_upload,
            jpeg_quality: settings.jpeg_quality.clamp(1, 100),
            visibility: settings.default_visibility,
            retry: RetryPolicy::from(&settings.retry),
            auth_recheck: settings.auth_recheck_interval(),
        }
    }
}

/// Collaborators the pipeline drives.
#[derive(Clone)]
pub struct PipelineDeps {
    pub ledger: UploadLedger,
    pub correlator: LogCorrelator,
    pub extractor: GridMetadataExtractor,
    pub transport: Arc<dyn UploadTransport>,
    pub auth: Arc<dyn AuthClient>,
    pub status: StatusCollector,
}

enum WorkItem {
    Capture(CaptureEvent),
    Retry(RetryTicket),
}

/// A converted job waiting for (another) upload attempt. Holds the claim.
struct RetryTicket {
    job: UploadJob,
    request: UploadRequest,
    _claim: ClaimGuard,
}

struct Shared {
    deps: PipelineDeps,
    config: watch::Sender<PipelineConfig>,
    events: broadcast::Sender<PipelineEvent>,
    queue: mpsc::UnboundedSender<WorkItem>,
    cancel_token: CancellationToken,
}

impl Shared {
    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    async fn raise(&self, condition: Condition) -> bool {
        let raised = self.deps.status.raise(condition).await;
        if raised {
            self.emit(PipelineEvent::Paused { condition });
        }
        raised
    }

    async fn clear(&self, condition: Condition) -> bool {
        let cleared = self.deps.status.clear(condition).await;
        if cleared {
            self.emit(PipelineEvent::Resumed { condition });
        }
        cleared
    }

    /// Returns false once the workers are gone.
    async fn enqueue(&self, event: CaptureEvent) -> bool {
        let path = event.file_path.clone();
        self.deps.status.job_queued().await;
        if self.queue.send(WorkItem::Capture(event)).is_err() {
            self.deps.status.queued_dropped().await;
            return false;
        }
        self.emit(PipelineEvent::Queued { path });
        true
    }

    async fn record(&self, entry: LedgerEntry) {
        if let Err(err) = self.deps.ledger.upsert(&entry).await {
            log_error!(
                "failed to record {} as {} in ledger: {err:#}",
                entry.content_fingerprint.short(),
                entry.last_state
            );
        }
    }

    /// Puts `item` back on the queue after `delay` unless shutdown comes first.
    async fn park(self: &Arc<Self>, item: WorkItem, delay: Duration) {
        self.deps.status.job_parked().await;
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = shared.cancel_token.cancelled() => {
                    shared.deps.status.parked_dropped().await;
                }
                _ = tokio::time::sleep(delay) => {
                    shared.deps.status.job_requeued().await;
                    if shared.queue.send(item).is_err() {
                        shared.deps.status.parked_dropped().await;
                    }
                }
            }
        });
    }
}

pub struct Pipeline {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    intake: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawns `config.worker_count` workers. Cancelling `parent` stops them
    /// from taking new work.
    pub async fn start(
        deps: PipelineDeps,
        config: PipelineConfig,
        parent: &CancellationToken,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let worker_count = config.worker_count.max(1);
        let auto_upload = config.auto_upload;
        let (config, _) = watch::channel(config);

        let shared = Arc::new(Shared {
            deps,
            config,
            events,
            queue: queue_tx,
            cancel_token: parent.child_token(),
        });

        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let workers = (0..worker_count)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    Arc::clone(&shared),
                    Arc::clone(&queue_rx),
                ))
            })
            .collect();

        if !auto_upload {
            log_info!("auto upload is off, workers start paused");
            shared.raise(Condition::UploadsDisabled).await;
        }
        log_info!("upload pipeline started with {worker_count} worker(s)");

        Self {
            shared,
            workers,
            intake: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.shared.events.subscribe()
    }

    pub async fn status(&self) -> StatusSnapshot {
        self.shared.deps.status.snapshot().await
    }

    pub fn config(&self) -> PipelineConfig {
        self.shared.config.borrow().clone()
    }

    /// Accepts one capture. Never blocks; the pool picks it up when a worker
    /// is free.
    pub async fn submit(&self, event: CaptureEvent) -> bool {
        self.shared.enqueue(event).await
    }

    /// Forwards every capture from `captures` into the pool until the channel
    /// closes or the pipeline shuts down.
    pub fn attach_source(&mut self, mut captures: mpsc::UnboundedReceiver<CaptureEvent>) {
        let shared = Arc::clone(&self.shared);
        self.intake = Some(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = shared.cancel_token.cancelled() => break,
                    event = captures.recv() => event,
                };
                let Some(event) = event else { break };
                if !shared.enqueue(event).await {
                    break;
                }
            }
        }));
    }

    /// Applies a new configuration to jobs started from now on. The worker
    /// count is fixed for the lifetime of the pipeline.
    pub async fn update_config(&self, next: PipelineConfig) {
        let previous = self.shared.config.send_replace(next.clone());
        if previous.worker_count != next.worker_count {
            log_warn!(
                "worker_count change to {} takes effect after restart",
                next.worker_count
            );
        }
        if previous.auto_upload != next.auto_upload {
            if next.auto_upload {
                log_info!("auto upload enabled, resuming workers");
                self.shared.clear(Condition::UploadsDisabled).await;
            } else {
                log_info!("auto upload disabled, pausing workers");
                self.shared.raise(Condition::UploadsDisabled).await;
            }
        }
    }

    /// Stops taking new work, lets in-flight jobs finish within `grace`, then
    /// aborts whatever is left. Queued jobs are dropped.
    pub async fn shutdown(mut self, grace: Duration) {
        self.shared.cancel_token.cancel();
        if let Some(intake) = self.intake.take() {
            intake.abort();
        }

        let mut workers = std::mem::take(&mut self.workers);
        let drained = tokio::time::timeout(grace, async {
            for worker in workers.iter_mut() {
                let _ = worker.await;
            }
        })
        .await;

        if drained.is_err() {
            log_warn!("in-flight uploads did not finish within {grace:?}, aborting");
            for worker in &workers {
                worker.abort();
            }
        }
        log_info!("upload pipeline stopped");
    }
}

async fn worker_loop(
    id: usize,
    shared: Arc<Shared>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
) {
    let mut config_rx = shared.config.subscribe();

    loop {
        if !config_rx.borrow_and_update().auto_upload {
            tokio::select! {
                biased;
                _ = shared.cancel_token.cancelled() => break,
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
        }

        let item = tokio::select! {
            biased;
            _ = shared.cancel_token.cancelled() => break,
            changed = config_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            item = async { queue.lock().await.recv().await } => item,
        };
        let Some(item) = item else { break };

        let config = config_rx.borrow().clone();
        shared.deps.status.job_started().await;
        match item {
            WorkItem::Capture(event) => process_capture(&shared, &config, event).await,
            WorkItem::Retry(ticket) => attempt_upload(&shared, &config, ticket).await,
        }
    }

    log_info!("upload worker {id} shutting down");
}

async fn process_capture(shared: &Arc<Shared>, config: &PipelineConfig, event: CaptureEvent) {
    let path = event.file_path.clone();
    let file_name = event.file_name();

    let (fingerprint, bytes) = match Fingerprint::of_file(&path).await {
        Ok(read) => read,
        Err(err) => {
            log_warn!("skipping unreadable capture {}: {err:#}", path.display());
            let reason = format!("{err:#}");
            shared
                .deps
                .status
                .job_finished(JobOutcome::Unreadable {
                    file_name,
                    reason: reason.clone(),
                })
                .await;
            shared.emit(PipelineEvent::Failed {
                job_id: None,
                path,
                reason,
            });
            return;
        }
    };

    let (claim, previous) = match shared.deps.ledger.claim(&fingerprint).await {
        Ok(Claim::Acquired(claim, previous)) => (claim, previous),
        Ok(Claim::AlreadyHandled(entry)) => {
            log_info!(
                "{} already {} ({}), skipping",
                path.display(),
                entry.last_state,
                fingerprint.short()
            );
            skip_duplicate(shared, path, &fingerprint, Some(entry.last_state)).await;
            return;
        }
        Ok(Claim::InFlight) => {
            log_info!("{} is already being uploaded, skipping", path.display());
            skip_duplicate(shared, path, &fingerprint, None).await;
            return;
        }
        Err(err) => {
            log_error!("ledger lookup failed for {}: {err:#}", path.display());
            shared
                .park(WorkItem::Capture(event), LEDGER_RETRY_DELAY)
                .await;
            return;
        }
    };

    let prior_attempts = previous.map(|entry| entry.attempt_count).unwrap_or(0);
    let mut job = UploadJob::new(event, fingerprint, config.visibility, prior_attempts);
    shared.emit(PipelineEvent::Started {
        job_id: job.id,
        path: path.clone(),
        fingerprint: job.fingerprint.to_string(),
    });

    job.log_context = shared.deps.correlator.context_at(job.capture.capture_time());
    if job.log_context.is_none() {
        log_info!("no world context for {}, uploading without it", path.display());
    }

    if let Err(err) = job.advance(JobState::Converting) {
        log_error!("{err}");
    }

    let extractor = shared.deps.extractor.clone();
    let quality = config.jpeg_quality;
    let converted = tokio::task::spawn_blocking(move || {
        let image = decode_capture(&bytes)?;
        let pose = extractor.extract_image(&image);
        let jpeg = encode_jpeg(&image, quality)?;
        Ok::<(PoseMetadata, Vec<u8>), ConversionError>((pose, jpeg))
    })
    .await;

    let (pose, jpeg) = match converted {
        Ok(Ok(done)) => done,
        Ok(Err(err)) => {
            fail_job(shared, job, format!("conversion failed: {err}")).await;
            return;
        }
        Err(join_err) => {
            fail_job(shared, job, format!("conversion worker failed: {join_err}")).await;
            return;
        }
    };
    job.pose = pose;

    let request = UploadRequest {
        jpeg,
        file_name,
        taken_at: job.capture.capture_time(),
        visibility: job.visibility,
        context: job.log_context.clone(),
        pose: job.pose,
    };

    attempt_upload(
        shared,
        config,
        RetryTicket {
            job,
            request,
            _claim: claim,
        },
    )
    .await;
}

async fn attempt_upload(shared: &Arc<Shared>, config: &PipelineConfig, ticket: RetryTicket) {
    let credential = match shared.deps.auth.current_credential().await {
        Ok(credential) => {
            shared.clear(Condition::AuthRequired).await;
            credential
        }
        Err(err) => {
            if shared.raise(Condition::AuthRequired).await {
                log_warn!("{err}; uploads paused until a credential is available");
            }
            shared
                .park(WorkItem::Retry(ticket), config.auth_recheck)
                .await;
            return;
        }
    };

    let RetryTicket {
        mut job,
        request,
        _claim,
    } = ticket;

    if let Err(err) = job.advance(JobState::Uploading) {
        log_error!("{err}");
        return finish_abandoned(shared).await;
    }

    let result = shared.deps.transport.upload(&credential, &request).await;
    let attempted_at = Utc::now();

    match result {
        Ok(receipt) => {
            shared.clear(Condition::ServerUnreachable).await;
            if let Err(err) = job.advance(JobState::Succeeded) {
                log_error!("{err}");
            }
            if receipt.remote_id.is_none() {
                log_warn!(
                    "upload of {} succeeded but the response carried no id",
                    job.capture.path().display()
                );
            }
            log_info!(
                "uploaded {} after {} attempt(s)",
                job.capture.path().display(),
                job.attempt_count
            );

            let mut entry = ledger_entry(&job, attempted_at);
            entry.remote_id = receipt.remote_id.clone();
            shared.record(entry).await;

            shared.deps.status.job_finished(JobOutcome::Succeeded).await;
            shared.emit(PipelineEvent::Succeeded {
                job_id: job.id,
                path: job.capture.file_path.clone(),
                remote_id: receipt.remote_id,
                attempts: job.attempt_count,
            });
        }
        Err(UploadError::AuthRequired(_)) => {
            shared.clear(Condition::ServerUnreachable).await;
            shared.deps.auth.invalidate(&credential).await;
            if shared.raise(Condition::AuthRequired).await {
                log_warn!("server rejected the credential; uploads paused until sign-in");
            }
            if let Err(err) = job.reject_credential() {
                log_error!("{err}");
            }
            shared.record(ledger_entry(&job, attempted_at)).await;
            shared
                .park(
                    WorkItem::Retry(RetryTicket {
                        job,
                        request,
                        _claim,
                    }),
                    config.auth_recheck,
                )
                .await;
        }
        Err(err) if err.is_retryable() => {
            if matches!(err, UploadError::Unreachable(_)) {
                if shared.raise(Condition::ServerUnreachable).await {
                    log_warn!("upload server unreachable: {err}");
                }
            } else {
                shared.clear(Condition::ServerUnreachable).await;
            }

            if let Err(transition) = job.advance(JobState::FailedRetryable) {
                log_error!("{transition}");
            }
            job.last_error = Some(err.to_string());

            if config.retry.exhausted(job.attempt_count) {
                let reason = format!("giving up after {} attempts: {err}", job.attempt_count);
                fail_job(shared, job, reason).await;
                return;
            }

            let retry_after = match &err {
                UploadError::RateLimited { retry_after } => *retry_after,
                _ => None,
            };
            let delay = config.retry.delay_with_hint(job.attempt_count, retry_after);
            log_warn!(
                "upload of {} failed ({err}), retry {} in {delay:?}",
                job.capture.path().display(),
                job.attempt_count + 1
            );

            shared.record(ledger_entry(&job, attempted_at)).await;
            shared.emit(PipelineEvent::Retrying {
                job_id: job.id,
                attempt: job.attempt_count,
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                reason: err.to_string(),
            });
            shared
                .park(
                    WorkItem::Retry(RetryTicket {
                        job,
                        request,
                        _claim,
                    }),
                    delay,
                )
                .await;
        }
        Err(err) => {
            if matches!(err, UploadError::Rejected { .. }) {
                shared.clear(Condition::ServerUnreachable).await;
            }
            fail_job(shared, job, err.to_string()).await;
        }
    }
}

fn ledger_entry(job: &UploadJob, attempted_at: chrono::DateTime<Utc>) -> LedgerEntry {
    LedgerEntry {
        attempt_count: job.attempt_count,
        last_attempt_at: (job.attempt_count > 0).then_some(attempted_at),
        file_path: Some(job.capture.path().display().to_string()),
        last_error: job.last_error.clone(),
        ..LedgerEntry::new(job.fingerprint.clone(), job.state)
    }
}

async fn fail_job(shared: &Arc<Shared>, mut job: UploadJob, reason: String) {
    log_warn!("{} failed permanently: {reason}", job.capture.path().display());
    if let Err(err) = job.fail_permanently(reason.clone()) {
        log_error!("{err}");
    }
    shared.record(ledger_entry(&job, Utc::now())).await;
    shared
        .deps
        .status
        .job_finished(JobOutcome::FailedPermanent {
            file_name: job.capture.file_name(),
            reason: reason.clone(),
        })
        .await;
    shared.emit(PipelineEvent::Failed {
        job_id: Some(job.id),
        path: job.capture.file_path.clone(),
        reason,
    });
}

async fn skip_duplicate(
    shared: &Arc<Shared>,
    path: std::path::PathBuf,
    fingerprint: &Fingerprint,
    previous: Option<JobState>,
) {
    shared
        .deps
        .status
        .job_finished(JobOutcome::SkippedDuplicate)
        .await;
    shared.emit(PipelineEvent::SkippedDuplicate {
        path,
        fingerprint: fingerprint.to_string(),
        previous,
    });
}

async fn finish_abandoned(shared: &Arc<Shared>) {
    shared.deps.status.job_finished(JobOutcome::Abandoned).await;
}

/// Startup summary of what the ledger already holds.
pub async fn log_ledger_summary(ledger: &UploadLedger) -> Result<()> {
    let counts = ledger.state_counts().await?;
    log_info!(
        "ledger: {} succeeded, {} failed permanently, {} awaiting retry",
        counts.succeeded,
        counts.failed_permanent,
        counts.failed_retryable
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use chrono::{FixedOffset, TimeZone};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

    use crate::correlator::LogTimezone;
    use crate::db::Database;
    use crate::grid::{paint_grid, GridLayout, Transform};
    use crate::upload::{AuthRequired, Credential, UploadReceipt};

    #[derive(Default)]
    struct ScriptedTransport {
        script: StdMutex<VecDeque<Result<UploadReceipt, UploadError>>>,
        requests: StdMutex<Vec<UploadRequest>>,
        calls: AtomicU32,
        delay: Duration,
    }

    impl ScriptedTransport {
        fn with_script(script: Vec<Result<UploadReceipt, UploadError>>) -> Self {
            Self {
                script: StdMutex::new(script.into()),
                ..Self::default()
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn last_request(&self) -> UploadRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl UploadTransport for ScriptedTransport {
        async fn upload(
            &self,
            _credential: &Credential,
            request: &UploadRequest,
        ) -> Result<UploadReceipt, UploadError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.requests.lock().unwrap().push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| {
                Ok(UploadReceipt {
                    remote_id: Some(format!("photo-{call}")),
                })
            })
        }
    }

    struct SwitchableAuth {
        token: StdMutex<Option<String>>,
    }

    impl SwitchableAuth {
        fn new(token: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                token: StdMutex::new(token.map(str::to_string)),
            })
        }

        fn sign_in(&self, token: &str) {
            *self.token.lock().unwrap() = Some(token.to_string());
        }
    }

    #[async_trait]
    impl AuthClient for SwitchableAuth {
        async fn current_credential(&self) -> Result<Credential, AuthRequired> {
            self.token
                .lock()
                .unwrap()
                .clone()
                .map(Credential::new)
                .ok_or(AuthRequired)
        }

        async fn invalidate(&self, rejected: &Credential) {
            let mut token = self.token.lock().unwrap();
            if token.as_deref() == Some(rejected.bearer()) {
                *token = None;
            }
        }
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            worker_count: 2,
            auto_upload: true,
            jpeg_quality: 80,
            visibility: Visibility::Friends,
            retry: RetryPolicy {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                max_attempts: 8,
                jitter_ratio: 0.0,
            },
            auth_recheck: Duration::from_millis(20),
        }
    }

    struct Harness {
        pipeline: Pipeline,
        events: broadcast::Receiver<PipelineEvent>,
        transport: Arc<ScriptedTransport>,
        ledger: UploadLedger,
        correlator: LogCorrelator,
        dir: tempfile::TempDir,
        _root: CancellationToken,
    }

    async fn harness(
        transport: ScriptedTransport,
        auth: Arc<dyn AuthClient>,
        config: PipelineConfig,
    ) -> Harness {
        let transport = Arc::new(transport);
        let ledger = UploadLedger::new(Database::in_memory().unwrap());
        let correlator =
            LogCorrelator::new(LogTimezone::Fixed(FixedOffset::east_opt(0).unwrap())).unwrap();
        let root = CancellationToken::new();
        let deps = PipelineDeps {
            ledger: ledger.clone(),
            correlator: correlator.clone(),
            extractor: GridMetadataExtractor::default(),
            transport: transport.clone(),
            auth,
            status: StatusCollector::new(),
        };
        let pipeline = Pipeline::start(deps, config, &root).await;
        Harness {
            events: pipeline.subscribe(),
            pipeline,
            transport,
            ledger,
            correlator,
            dir: tempfile::tempdir().unwrap(),
            _root: root,
        }
    }

    fn png_bytes(image: RgbImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn plain_png(seed: u8) -> Vec<u8> {
        png_bytes(RgbImage::from_pixel(32, 24, Rgb([seed, 40, 90])))
    }

    fn capture(dir: &Path, name: &str, bytes: &[u8]) -> CaptureEvent {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        CaptureEvent::new(path, bytes.len() as u64, None)
    }

    async fn next_matching<F>(
        events: &mut broadcast::Receiver<PipelineEvent>,
        mut predicate: F,
    ) -> PipelineEvent
    where
        F: FnMut(&PipelineEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = events.recv().await.unwrap();
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for pipeline event")
    }

    fn is_terminal(event: &PipelineEvent) -> bool {
        matches!(
            event,
            PipelineEvent::Succeeded { .. }
                | PipelineEvent::Failed { .. }
                | PipelineEvent::SkippedDuplicate { .. }
        )
    }

    #[tokio::test]
    async fn transient_failures_then_success_counts_four_attempts() {
        let transport = ScriptedTransport::with_script(vec![
            Err(UploadError::Transient("HTTP 503".into())),
            Err(UploadError::Unreachable("connection reset".into())),
            Err(UploadError::Transient("timed out".into())),
        ]);
        let mut h = harness(transport, SwitchableAuth::new(Some("tok")), test_config()).await;
        let bytes = plain_png(1);
        h.pipeline.submit(capture(h.dir.path(), "a.png", &bytes)).await;

        let done = next_matching(&mut h.events, is_terminal).await;
        let PipelineEvent::Succeeded {
            attempts,
            remote_id,
            ..
        } = done
        else {
            panic!("expected success, got {done:?}");
        };
        assert_eq!(attempts, 4);
        assert_eq!(remote_id.as_deref(), Some("photo-4"));
        assert_eq!(h.transport.calls(), 4);

        let entry = h
            .ledger
            .lookup(&Fingerprint::of_bytes(&bytes))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.last_state, JobState::Succeeded);
        assert_eq!(entry.attempt_count, 4);
        assert_eq!(entry.remote_id.as_deref(), Some("photo-4"));

        let status = h.pipeline.status().await;
        assert_eq!(status.succeeded, 1);
        assert_eq!((status.pending, status.in_flight, status.retrying), (0, 0, 0));
        assert!(status.conditions.is_empty());
    }

    #[tokio::test]
    async fn duplicate_content_uploads_once_under_concurrent_triggers() {
        let transport = ScriptedTransport {
            delay: Duration::from_millis(100),
            ..ScriptedTransport::default()
        };
        let mut h = harness(transport, SwitchableAuth::new(Some("tok")), test_config()).await;
        let bytes = plain_png(2);
        let first = capture(h.dir.path(), "a.png", &bytes);
        h.pipeline.submit(first.clone()).await;
        h.pipeline.submit(first).await;
        h.pipeline.submit(capture(h.dir.path(), "copy.png", &bytes)).await;
        h.pipeline.submit(capture(h.dir.path(), "copy2.png", &bytes)).await;

        let mut succeeded = 0;
        let mut skipped = 0;
        while succeeded + skipped < 4 {
            match next_matching(&mut h.events, is_terminal).await {
                PipelineEvent::Succeeded { .. } => succeeded += 1,
                PipelineEvent::SkippedDuplicate { .. } => skipped += 1,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!((succeeded, skipped), (1, 3));
        assert_eq!(h.transport.calls(), 1);
        assert_eq!(h.pipeline.status().await.skipped_duplicates, 3);
    }

    #[tokio::test]
    async fn corrupt_capture_fails_permanently_without_upload() {
        let mut h = harness(
            ScriptedTransport::default(),
            SwitchableAuth::new(Some("tok")),
            test_config(),
        )
        .await;
        let bytes = b"\x89PNG\r\n\x1a\ntruncated".to_vec();
        h.pipeline.submit(capture(h.dir.path(), "broken.png", &bytes)).await;

        let done = next_matching(&mut h.events, is_terminal).await;
        assert!(
            matches!(done, PipelineEvent::Failed { job_id: Some(_), .. }),
            "{done:?}"
        );
        assert_eq!(h.transport.calls(), 0);

        let entry = h
            .ledger
            .lookup(&Fingerprint::of_bytes(&bytes))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.last_state, JobState::FailedPermanent);
        assert_eq!(entry.attempt_count, 0);
        assert!(entry.last_error.unwrap().contains("conversion failed"));
    }

    #[tokio::test]
    async fn undecodable_grid_still_uploads() {
        let mut h = harness(
            ScriptedTransport::default(),
            SwitchableAuth::new(Some("tok")),
            test_config(),
        )
        .await;
        h.pipeline
            .submit(capture(h.dir.path(), "plain.png", &plain_png(3)))
            .await;
        h.pipeline
            .submit(capture(h.dir.path(), "other.png", &plain_png(4)))
            .await;

        for _ in 0..2 {
            let done = next_matching(&mut h.events, is_terminal).await;
            assert!(matches!(done, PipelineEvent::Succeeded { .. }), "{done:?}");
        }
        let request = h.transport.last_request();
        assert!(!request.pose.extracted_ok);
        assert!(request
            .form_fields()
            .iter()
            .all(|(name, _)| !name.starts_with("position_")));
        assert_eq!(&request.jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(request.visibility, Visibility::Friends);
    }

    #[tokio::test]
    async fn ledger_hit_skips_content_seen_in_an_earlier_run() {
        let mut h = harness(
            ScriptedTransport::default(),
            SwitchableAuth::new(Some("tok")),
            test_config(),
        )
        .await;
        let bytes = plain_png(5);
        h.ledger
            .upsert(&LedgerEntry::new(
                Fingerprint::of_bytes(&bytes),
                JobState::Succeeded,
            ))
            .await
            .unwrap();

        h.pipeline
            .submit(capture(h.dir.path(), "renamed.png", &bytes))
            .await;
        let done = next_matching(&mut h.events, is_terminal).await;
        assert!(
            matches!(
                done,
                PipelineEvent::SkippedDuplicate {
                    previous: Some(JobState::Succeeded),
                    ..
                }
            ),
            "{done:?}"
        );
        assert_eq!(h.transport.calls(), 0);
    }

    #[tokio::test]
    async fn rejection_is_permanent_and_not_retried() {
        let transport = ScriptedTransport::with_script(vec![Err(UploadError::Rejected {
            status: 400,
            message: "bad visibility".into(),
        })]);
        let mut h = harness(transport, SwitchableAuth::new(Some("tok")), test_config()).await;
        let bytes = plain_png(6);
        h.pipeline.submit(capture(h.dir.path(), "a.png", &bytes)).await;

        let done = next_matching(&mut h.events, is_terminal).await;
        assert!(matches!(done, PipelineEvent::Failed { .. }), "{done:?}");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.transport.calls(), 1);

        let entry = h
            .ledger
            .lookup(&Fingerprint::of_bytes(&bytes))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.last_state, JobState::FailedPermanent);
        assert_eq!(entry.attempt_count, 1);
        let status = h.pipeline.status().await;
        assert_eq!(status.failed_permanent, 1);
        assert_eq!(status.recent_failures[0].file_name, "a.png");
    }

    #[tokio::test]
    async fn exhausted_retry_budget_becomes_permanent() {
        let transport = ScriptedTransport::with_script(
            (0..5)
                .map(|_| Err(UploadError::Transient("HTTP 502".into())))
                .collect(),
        );
        let mut config = test_config();
        config.retry.max_attempts = 3;
        let mut h = harness(transport, SwitchableAuth::new(Some("tok")), config).await;
        let bytes = plain_png(7);
        h.pipeline.submit(capture(h.dir.path(), "a.png", &bytes)).await;

        let done = next_matching(&mut h.events, is_terminal).await;
        let PipelineEvent::Failed { reason, .. } = done else {
            panic!("expected failure, got {done:?}");
        };
        assert!(reason.contains("giving up after 3 attempts"));
        assert_eq!(h.transport.calls(), 3);
    }

    #[tokio::test]
    async fn missing_credential_pauses_until_signed_in() {
        let auth = SwitchableAuth::new(None);
        let mut h = harness(ScriptedTransport::default(), auth.clone(), test_config()).await;
        h.pipeline
            .submit(capture(h.dir.path(), "a.png", &plain_png(8)))
            .await;

        let paused = next_matching(&mut h.events, |e| matches!(e, PipelineEvent::Paused { .. })).await;
        assert_eq!(
            paused,
            PipelineEvent::Paused {
                condition: Condition::AuthRequired
            }
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(h.transport.calls(), 0);
        assert!(h
            .pipeline
            .status()
            .await
            .conditions
            .contains(&Condition::AuthRequired));

        auth.sign_in("fresh");
        let done = next_matching(&mut h.events, is_terminal).await;
        let PipelineEvent::Succeeded { attempts, .. } = done else {
            panic!("expected success, got {done:?}");
        };
        assert_eq!(attempts, 1);
        assert!(h.pipeline.status().await.conditions.is_empty());
    }

    #[tokio::test]
    async fn unauthorized_response_invalidates_and_waits_for_new_token() {
        let auth = SwitchableAuth::new(Some("expired"));
        let transport =
            ScriptedTransport::with_script(vec![Err(UploadError::AuthRequired(AuthRequired))]);
        let mut h = harness(transport, auth.clone(), test_config()).await;
        let bytes = plain_png(9);
        h.pipeline.submit(capture(h.dir.path(), "a.png", &bytes)).await;

        next_matching(&mut h.events, |e| {
            matches!(
                e,
                PipelineEvent::Paused {
                    condition: Condition::AuthRequired
                }
            )
        })
        .await;
        assert!(auth.current_credential().await.is_err());

        let entry = h
            .ledger
            .lookup(&Fingerprint::of_bytes(&bytes))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.last_state, JobState::FailedRetryable);

        auth.sign_in("renewed");
        let done = next_matching(&mut h.events, is_terminal).await;
        let PipelineEvent::Succeeded { attempts, .. } = done else {
            panic!("expected success, got {done:?}");
        };
        assert_eq!(attempts, 1);
        assert_eq!(h.transport.calls(), 2);
    }

    #[tokio::test]
    async fn credential_rejections_do_not_exhaust_the_retry_budget() {
        let auth = SwitchableAuth::new(Some("first"));
        let transport = ScriptedTransport::with_script(vec![
            Err(UploadError::AuthRequired(AuthRequired)),
            Err(UploadError::AuthRequired(AuthRequired)),
            Err(UploadError::Transient("HTTP 503".into())),
        ]);
        let mut config = test_config();
        config.retry.max_attempts = 3;
        let mut h = harness(transport, auth.clone(), config).await;
        let bytes = plain_png(11);
        h.pipeline.submit(capture(h.dir.path(), "a.png", &bytes)).await;

        for token in ["second", "third"] {
            next_matching(&mut h.events, |e| {
                matches!(
                    e,
                    PipelineEvent::Paused {
                        condition: Condition::AuthRequired
                    }
                )
            })
            .await;
            auth.sign_in(token);
        }

        let done = next_matching(&mut h.events, is_terminal).await;
        let PipelineEvent::Succeeded { attempts, .. } = done else {
            panic!("expected success, got {done:?}");
        };
        assert_eq!(attempts, 2);
        assert_eq!(h.transport.calls(), 4);

        let entry = h
            .ledger
            .lookup(&Fingerprint::of_bytes(&bytes))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.last_state, JobState::Succeeded);
        assert_eq!(entry.attempt_count, 2);
    }

    #[tokio::test]
    async fn disabled_auto_upload_holds_jobs_until_enabled() {
        let mut config = test_config();
        config.auto_upload = false;
        let mut h = harness(
            ScriptedTransport::default(),
            SwitchableAuth::new(Some("tok")),
            config.clone(),
        )
        .await;
        h.pipeline
            .submit(capture(h.dir.path(), "a.png", &plain_png(10)))
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.transport.calls(), 0);
        let status = h.pipeline.status().await;
        assert_eq!(status.pending, 1);
        assert_eq!(status.conditions, vec![Condition::UploadsDisabled]);

        config.auto_upload = true;
        h.pipeline.update_config(config).await;
        let done = next_matching(&mut h.events, is_terminal).await;
        assert!(matches!(done, PipelineEvent::Succeeded { .. }), "{done:?}");
        assert!(h.pipeline.status().await.conditions.is_empty());
    }

    #[tokio::test]
    async fn context_and_pose_flow_into_the_request() {
        let mut h = harness(
            ScriptedTransport::default(),
            SwitchableAuth::new(Some("tok")),
            test_config(),
        )
        .await;
        h.correlator.ingest([
            "2024.06.01 10:00:50 Log - [Behaviour] Joining wrld_one:100~private(usr_a)",
            "2024.06.01 10:02:30 Log - [Behaviour] Joining wrld_two:200",
        ]);

        let mut image = RgbImage::new(1280, 720);
        paint_grid(
            &mut image,
            &GridLayout::default(),
            Transform::Identity,
            [321.0, 1.25, 2.5, -3.75, 10.0, 20.0, 30.0],
        );
        let bytes = png_bytes(image);
        let path = h.dir.path().join("shot001.png");
        std::fs::write(&path, &bytes).unwrap();
        let taken = Utc.with_ymd_and_hms(2024, 6, 1, 10, 1, 40).unwrap();
        h.pipeline
            .submit(CaptureEvent::new(path, bytes.len() as u64, Some(taken)))
            .await;

        let done = next_matching(&mut h.events, is_terminal).await;
        assert!(matches!(done, PipelineEvent::Succeeded { .. }), "{done:?}");

        let request = h.transport.last_request();
        let context = request.context.clone().unwrap();
        assert_eq!(context.world_id, "wrld_one");
        assert_eq!(context.instance_type, crate::models::InstanceType::Private);
        assert_eq!(request.taken_at, taken);
        assert!(request.pose.extracted_ok);
        assert_eq!(request.pose.world_code, Some(321));
        assert_eq!(request.pose.position.z, -3.75);
    }

    #[tokio::test]
    async fn shutdown_lets_in_flight_finish_and_drops_the_queue() {
        let transport = ScriptedTransport {
            delay: Duration::from_millis(150),
            ..ScriptedTransport::default()
        };
        let mut config = test_config();
        config.worker_count = 1;
        let mut h = harness(transport, SwitchableAuth::new(Some("tok")), config).await;
        for seed in 20..23 {
            h.pipeline
                .submit(capture(h.dir.path(), &format!("{seed}.png"), &plain_png(seed)))
                .await;
        }
        next_matching(&mut h.events, |e| matches!(e, PipelineEvent::Started { .. })).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let Harness {
            pipeline,
            transport,
            ledger,
            ..
        } = h;
        pipeline.shutdown(Duration::from_secs(5)).await;

        assert_eq!(transport.calls(), 1);
        let counts = ledger.state_counts().await.unwrap();
        assert_eq!(counts.succeeded, 1);
        assert!(ledger
            .lookup(&Fingerprint::of_bytes(&plain_png(22)))
            .await
            .unwrap()
            .is_none());
    }
}
