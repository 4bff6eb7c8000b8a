//! World/instance context derived from the application log.
//!
//! One tail task appends transitions; any number of pipeline workers read
//! them through `context_at`. Readers clone out of a `RwLock`, so a
//! half-applied transition is never visible. The live location and signed-in
//! user are also published on a `watch` channel for the presence reporter.

mod history;
mod parser;
mod tailer;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, PoisonError, RwLock,
};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::metrics::{Condition, StatusCollector};
use crate::models::{LogContext, Presence};

pub use history::{ContextHistory, DEFAULT_HISTORY_CAPACITY};
pub use parser::{LogLineParser, LogTimezone, ParsedLine};
pub use tailer::{resolve_log_file, LogTailer, TailBatch};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub transitions: usize,
    pub parse_failures: u64,
}

#[derive(Clone)]
pub struct LogCorrelator {
    history: Arc<RwLock<ContextHistory>>,
    parser: Arc<LogLineParser>,
    parse_failures: Arc<AtomicU64>,
    presence: Arc<watch::Sender<Presence>>,
}

impl LogCorrelator {
    pub fn new(timezone: LogTimezone) -> Result<Self> {
        Ok(Self {
            history: Arc::new(RwLock::new(ContextHistory::default())),
            parser: Arc::new(LogLineParser::new(timezone)?),
            parse_failures: Arc::new(AtomicU64::new(0)),
            presence: Arc::new(watch::channel(Presence::default()).0),
        })
    }

    pub fn subscribe_presence(&self) -> watch::Receiver<Presence> {
        self.presence.subscribe()
    }

    /// Context whose join is the latest one at or before `at`, or `None` when
    /// no join has been observed that early or the player had left by then.
    pub fn context_at(&self, at: DateTime<Utc>) -> Option<LogContext> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .context_at(at)
    }

    pub fn latest(&self) -> Option<LogContext> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .latest()
            .cloned()
    }

    pub fn transition_count(&self) -> usize {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn parse_failures(&self) -> u64 {
        self.parse_failures.load(Ordering::Relaxed)
    }

    pub fn ingest<'a, I>(&self, lines: I) -> IngestReport
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut report = IngestReport::default();
        for line in lines {
            match self.parser.parse(line) {
                ParsedLine::Join(context) => {
                    let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
                    let summary = format!(
                        "{}:{} ({}) at {}",
                        context.world_id, context.instance_id, context.instance_type, context.joined_at
                    );
                    if history.push(context.clone()) {
                        report.transitions += 1;
                        log_info!("joined {summary}");
                        self.set_location(Some(context));
                    } else {
                        log_debug!("ignoring repeated join {summary}");
                    }
                }
                ParsedLine::Leave { at } => {
                    let left = self
                        .history
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .leave(at);
                    if left {
                        report.transitions += 1;
                        log_info!("left instance at {at}");
                        self.set_location(None);
                    }
                }
                ParsedLine::RoomName(name) => {
                    self.history
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .name_latest(&name);
                }
                ParsedLine::UserAuthenticated(user) => {
                    self.presence.send_if_modified(|presence| {
                        if presence.user.as_ref() == Some(&user) {
                            return false;
                        }
                        log_info!("signed in to the game as {} ({})", user.display_name, user.user_id);
                        presence.user = Some(user);
                        true
                    });
                }
                ParsedLine::Malformed => {
                    report.parse_failures += 1;
                    log_debug!("unparseable transition line: {line}");
                }
                ParsedLine::Irrelevant => {}
            }
        }
        if report.parse_failures > 0 {
            self.parse_failures
                .fetch_add(report.parse_failures, Ordering::Relaxed);
        }
        report
    }

    fn set_location(&self, location: Option<LogContext>) {
        self.presence.send_if_modified(|presence| {
            let changed = match (&presence.location, &location) {
                (Some(current), Some(next)) => !current.same_join(next),
                (None, None) => false,
                _ => true,
            };
            if changed {
                presence.location = location;
            }
            changed
        });
    }
}

pub async fn tail_loop(
    correlator: LogCorrelator,
    mut tailer: LogTailer,
    poll_interval: Duration,
    status: StatusCollector,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match tailer.poll().await {
                    Ok(batch) => {
                        if status.clear(Condition::LogUnavailable).await {
                            log_info!("log source available again: {}", tailer.source().display());
                        }
                        if batch.reopened {
                            if let Some(path) = &batch.path {
                                log_info!("log rotated or truncated, reading {} from the start", path.display());
                            }
                        }
                        let report = correlator.ingest(batch.lines.iter().map(String::as_str));
                        if report.parse_failures > 0 {
                            status.record_log_parse_failures(report.parse_failures).await;
                        }
                    }
                    Err(err) => {
                        if status.raise(Condition::LogUnavailable).await {
                            log_warn!("log source unavailable, uploads continue without context: {err:#}");
                        }
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("log tail loop shutting down");
                break;
            }
        }
    }
}

pub struct CorrelatorController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl Default for CorrelatorController {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelatorController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start(
        &mut self,
        correlator: LogCorrelator,
        tailer: LogTailer,
        poll_interval: Duration,
        status: StatusCollector,
        parent: &CancellationToken,
    ) -> Result<()> {
        if self.handle.is_some() {
            bail!("log tail already active");
        }

        let cancel_token = parent.child_token();
        let handle = tokio::spawn(tail_loop(
            correlator,
            tailer,
            poll_interval,
            status,
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle.await.context("log tail task failed to join")
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};
    use std::io::Write;

    fn correlator() -> LogCorrelator {
        LogCorrelator::new(LogTimezone::Fixed(FixedOffset::east_opt(0).unwrap())).unwrap()
    }

    fn t(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 12, secs / 60, secs % 60).unwrap()
    }

    fn join_line(secs: u32, world: &str) -> String {
        format!(
            "2024.03.09 12:{:02}:{:02} Log        -  [Behaviour] Joining {world}:555~friends(usr_q)~region(eu)\n",
            secs / 60,
            secs % 60
        )
    }

    #[test]
    fn shot_between_two_joins_resolves_to_the_earlier_world() {
        let correlator = correlator();
        let log = format!("{}{}", join_line(50, "wrld_one"), join_line(150, "wrld_two"));
        let report = correlator.ingest(log.lines());
        assert_eq!(report.transitions, 2);

        let context = correlator.context_at(t(100)).unwrap();
        assert_eq!(context.world_id, "wrld_one");
        assert_eq!(context.instance_type, crate::models::InstanceType::Friends);
        assert!(correlator.context_at(t(10)).is_none());
        assert_eq!(correlator.context_at(t(150)).unwrap().world_id, "wrld_two");
    }

    #[test]
    fn malformed_joins_are_counted_and_skipped() {
        let correlator = correlator();
        let report = correlator.ingest([
            "no timestamp Joining wrld_x:1",
            "2024.03.09 12:00:01 unrelated chatter",
            join_line(5, "wrld_ok").trim_end(),
        ]);
        assert_eq!(
            report,
            IngestReport {
                transitions: 1,
                parse_failures: 1
            }
        );
        assert_eq!(correlator.parse_failures(), 1);
    }

    #[test]
    fn leave_line_clears_context_until_next_join() {
        let correlator = correlator();
        let report = correlator.ingest([
            join_line(10, "wrld_one").trim_end(),
            "2024.03.09 12:01:00 Log        -  [Behaviour] Leaving wrld_one",
            join_line(120, "wrld_two").trim_end(),
        ]);
        assert_eq!(report.transitions, 3);

        assert_eq!(correlator.context_at(t(30)).unwrap().world_id, "wrld_one");
        assert!(correlator.context_at(t(60)).is_none());
        assert!(correlator.context_at(t(119)).is_none());
        assert_eq!(correlator.context_at(t(120)).unwrap().world_id, "wrld_two");

        correlator.ingest(["2024.03.09 12:03:00 Log - [Behaviour] Leaving wrld_two"]);
        assert!(correlator.latest().is_none());
    }

    #[test]
    fn presence_follows_user_and_location() {
        let correlator = correlator();
        let mut presence = correlator.subscribe_presence();

        correlator.ingest([
            "2024.03.09 11:59:00 Log - User Authenticated: Kiri (usr_0b1c-77)",
            join_line(10, "wrld_one").trim_end(),
        ]);
        assert!(presence.has_changed().unwrap());
        let current = presence.borrow_and_update().clone();
        assert_eq!(current.user.unwrap().user_id, "usr_0b1c-77");
        assert_eq!(current.location.unwrap().world_id, "wrld_one");

        // Naming the room does not count as a move.
        correlator.ingest(["2024.03.09 12:00:11 Log - [Behaviour] Entering Room: Cafe"]);
        assert!(!presence.has_changed().unwrap());

        correlator.ingest(["2024.03.09 12:00:30 Log - [Behaviour] Leaving wrld_one"]);
        assert!(presence.borrow_and_update().location.is_none());
    }

    #[tokio::test]
    async fn truncation_mid_tail_neither_duplicates_nor_loses_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output_log_a.txt");
        std::fs::write(&path, join_line(10, "wrld_one") + &join_line(20, "wrld_two")).unwrap();

        let correlator = correlator();
        let mut tailer = LogTailer::new(path.clone());
        let batch = tailer.poll().await.unwrap();
        correlator.ingest(batch.lines.iter().map(String::as_str));
        assert_eq!(correlator.transition_count(), 2);

        // Rewritten shorter: one already-applied join plus one new one.
        std::fs::write(&path, join_line(20, "wrld_two")).unwrap();
        let batch = tailer.poll().await.unwrap();
        assert!(batch.reopened);
        correlator.ingest(batch.lines.iter().map(String::as_str));
        assert_eq!(correlator.transition_count(), 2);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(join_line(30, "wrld_three").as_bytes()).unwrap();
        let batch = tailer.poll().await.unwrap();
        correlator.ingest(batch.lines.iter().map(String::as_str));

        assert_eq!(correlator.transition_count(), 3);
        assert_eq!(correlator.context_at(t(15)).unwrap().world_id, "wrld_one");
        assert_eq!(correlator.context_at(t(25)).unwrap().world_id, "wrld_two");
        assert_eq!(correlator.context_at(t(35)).unwrap().world_id, "wrld_three");
    }

    #[tokio::test]
    async fn tail_loop_reports_missing_log_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("later.log");
        let status = StatusCollector::new();
        let correlator = correlator();
        let root = CancellationToken::new();

        let mut controller = CorrelatorController::new();
        controller
            .start(
                correlator.clone(),
                LogTailer::new(path.clone()),
                Duration::from_millis(20),
                status.clone(),
                &root,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(status.has(Condition::LogUnavailable).await);

        std::fs::write(&path, join_line(1, "wrld_late")).unwrap();
        let mut resolved = false;
        for _ in 0..100 {
            if correlator.latest().is_some() {
                resolved = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(resolved);
        assert!(!status.has(Condition::LogUnavailable).await);

        controller.stop().await.unwrap();
        assert!(!controller.is_running());
    }
}
