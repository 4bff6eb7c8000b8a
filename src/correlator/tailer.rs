//! Incremental reader for a growing log file.
//!
//! Each `poll` returns the complete lines appended since the previous poll.
//! The file is reopened from the start when it was replaced (different file
//! identity or a newer file in the log directory) or truncated (size below the
//! read offset). Lines longer than the per-poll read limit are dropped.

use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    time::SystemTime,
};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const LOG_FILE_PREFIX: &str = "output_log_";
const LOG_FILE_SUFFIX: &str = ".txt";
const MAX_READ_PER_POLL: u64 = 4 * 1024 * 1024;
const MAX_LINE_BYTES: usize = MAX_READ_PER_POLL as usize;

const ENABLE_LOGS: bool = true;

use crate::log_warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    #[cfg(unix)]
    dev: u64,
    #[cfg(unix)]
    ino: u64,
    /// A file recreated under the same name gets a new creation time.
    #[cfg(windows)]
    created: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(metadata: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    #[cfg(windows)]
    fn of(metadata: &std::fs::Metadata) -> Self {
        use std::os::windows::fs::MetadataExt;
        Self {
            created: metadata.creation_time(),
        }
    }

    #[cfg(not(any(unix, windows)))]
    fn of(_metadata: &std::fs::Metadata) -> Self {
        Self {}
    }
}

#[derive(Debug)]
struct OpenLog {
    path: PathBuf,
    identity: FileIdentity,
    offset: u64,
    partial: Vec<u8>,
    /// Discarding the rest of an over-long line up to its newline.
    skipping_line: bool,
}

#[derive(Debug, Default)]
pub struct TailBatch {
    pub lines: Vec<String>,
    /// The previous file was rotated or truncated and reading restarted at 0.
    pub reopened: bool,
    pub path: Option<PathBuf>,
}

#[derive(Debug)]
pub struct LogTailer {
    source: PathBuf,
    current: Option<OpenLog>,
}

impl LogTailer {
    /// `source` is either a log file or a directory of `output_log_*.txt` files.
    pub fn new(source: PathBuf) -> Self {
        Self {
            source,
            current: None,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub async fn poll(&mut self) -> Result<TailBatch> {
        let path = resolve_log_file(&self.source).await?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let identity = FileIdentity::of(&metadata);
        let len = metadata.len();

        let mut batch = TailBatch {
            path: Some(path.clone()),
            ..TailBatch::default()
        };

        let restart = match &self.current {
            None => true,
            Some(open) => {
                let replaced = open.path != path || open.identity != identity;
                let truncated = len < open.offset;
                if replaced || truncated {
                    batch.reopened = true;
                }
                replaced || truncated
            }
        };
        if restart {
            self.current = Some(OpenLog {
                path: path.clone(),
                identity,
                offset: 0,
                partial: Vec::new(),
                skipping_line: false,
            });
        }

        let Some(open) = self.current.as_mut() else {
            return Ok(batch);
        };
        if len <= open.offset {
            return Ok(batch);
        }

        let mut file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.seek(SeekFrom::Start(open.offset)).await?;

        let mut chunk = Vec::new();
        let read = file
            .take((len - open.offset).min(MAX_READ_PER_POLL))
            .read_to_end(&mut chunk)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        open.offset += read as u64;

        let mut fresh = chunk.as_slice();
        if open.skipping_line {
            match fresh.iter().position(|b| *b == b'\n') {
                Some(newline) => {
                    open.skipping_line = false;
                    fresh = &fresh[newline + 1..];
                }
                None => fresh = &[],
            }
        }

        open.partial.extend_from_slice(fresh);
        if let Some(last_newline) = open.partial.iter().rposition(|b| *b == b'\n') {
            let rest = open.partial.split_off(last_newline + 1);
            let complete = std::mem::replace(&mut open.partial, rest);
            batch.lines = complete
                .split(|b| *b == b'\n')
                .filter(|line| {
                    if line.len() > MAX_LINE_BYTES {
                        log_warn!("dropping {} byte line from {}", line.len(), path.display());
                        return false;
                    }
                    true
                })
                .map(|line| {
                    let line = line.strip_suffix(b"\r").unwrap_or(line);
                    String::from_utf8_lossy(line).into_owned()
                })
                .filter(|line| !line.is_empty())
                .collect();
        }

        if open.partial.len() > MAX_LINE_BYTES {
            log_warn!(
                "dropping {} buffered bytes of an unterminated line in {}",
                open.partial.len(),
                path.display()
            );
            open.partial = Vec::new();
            open.skipping_line = true;
        }

        Ok(batch)
    }
}

/// Picks the file to tail: the source itself, or the most recently modified
/// `output_log_*.txt` inside it.
pub async fn resolve_log_file(source: &Path) -> Result<PathBuf> {
    let metadata = tokio::fs::metadata(source)
        .await
        .with_context(|| format!("log source {} is not accessible", source.display()))?;
    if metadata.is_file() {
        return Ok(source.to_path_buf());
    }

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    let mut entries = tokio::fs::read_dir(source)
        .await
        .with_context(|| format!("failed to list {}", source.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with(LOG_FILE_PREFIX) && name.ends_with(LOG_FILE_SUFFIX)) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let path = entry.path();
        let newer = match &newest {
            None => true,
            Some((best_time, best_path)) => {
                (modified, path.as_path()) > (*best_time, best_path.as_path())
            }
        };
        if newer {
            newest = Some((modified, path));
        }
    }

    match newest {
        Some((_, path)) => Ok(path),
        None => bail!("no {LOG_FILE_PREFIX}*{LOG_FILE_SUFFIX} in {}", source.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn returns_only_complete_new_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("game.log");
        append(&log, "one\ntwo\nthr");

        let mut tailer = LogTailer::new(log.clone());
        let batch = tailer.poll().await.unwrap();
        assert_eq!(batch.lines, vec!["one", "two"]);
        assert!(!batch.reopened);

        assert!(tailer.poll().await.unwrap().lines.is_empty());

        append(&log, "ee\r\nfour\n");
        assert_eq!(tailer.poll().await.unwrap().lines, vec!["three", "four"]);
    }

    #[tokio::test]
    async fn truncation_restarts_from_the_beginning() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("game.log");
        append(&log, "first line that is fairly long\nsecond\n");

        let mut tailer = LogTailer::new(log.clone());
        assert_eq!(tailer.poll().await.unwrap().lines.len(), 2);

        std::fs::write(&log, "fresh\n").unwrap();
        let batch = tailer.poll().await.unwrap();
        assert!(batch.reopened);
        assert_eq!(batch.lines, vec!["fresh"]);
    }

    #[tokio::test]
    async fn directory_source_follows_the_newest_log() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("output_log_2024-01-01_00-00-00.txt");
        append(&old, "old\n");
        std::fs::write(dir.path().join("notes.txt"), "ignore me\n").unwrap();

        let mut tailer = LogTailer::new(dir.path().to_path_buf());
        let batch = tailer.poll().await.unwrap();
        assert_eq!(batch.lines, vec!["old"]);
        assert_eq!(batch.path.as_deref(), Some(old.as_path()));

        let newer = dir.path().join("output_log_2024-01-02_00-00-00.txt");
        append(&newer, "new\n");
        let past = SystemTime::now() - std::time::Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(past)
            .unwrap();

        let batch = tailer.poll().await.unwrap();
        assert!(batch.reopened);
        assert_eq!(batch.lines, vec!["new"]);
    }

    #[tokio::test]
    async fn over_long_lines_are_dropped_and_buffer_stays_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("game.log");
        append(&log, "before\n");
        append(&log, &"x".repeat(2 * MAX_LINE_BYTES + 5));

        let mut tailer = LogTailer::new(log.clone());
        let mut lines = Vec::new();
        for _ in 0..3 {
            lines.extend(tailer.poll().await.unwrap().lines);
            let buffered = tailer.current.as_ref().unwrap().partial.len();
            assert!(buffered <= MAX_LINE_BYTES, "buffered {buffered} bytes");
        }
        assert_eq!(lines, vec!["before"]);

        append(&log, "xx tail of the long line\nafter\n");
        let batch = tailer.poll().await.unwrap();
        assert_eq!(batch.lines, vec!["after"]);
    }

    #[tokio::test]
    async fn line_completed_past_the_limit_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("game.log");
        append(&log, &"y".repeat(MAX_LINE_BYTES + 10));
        append(&log, "\nnext\n");

        let mut tailer = LogTailer::new(log.clone());
        let mut lines = Vec::new();
        for _ in 0..2 {
            lines.extend(tailer.poll().await.unwrap().lines);
        }
        assert_eq!(lines, vec!["next"]);
    }

    #[tokio::test]
    async fn missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut tailer = LogTailer::new(dir.path().join("absent"));
        assert!(tailer.poll().await.is_err());

        let mut empty_dir = LogTailer::new(dir.path().to_path_buf());
        assert!(empty_dir.poll().await.is_err());
    }
}
