use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    helpers::{parse_optional_datetime, parse_state, to_i64, to_u32},
    models::{LedgerEntry, StateCounts, UpsertOutcome},
    Database,
};
use crate::fingerprint::Fingerprint;
use crate::models::JobState;

struct RawEntry {
    fingerprint: String,
    last_state: String,
    attempt_count: i64,
    last_attempt_at: Option<String>,
    file_path: Option<String>,
    remote_id: Option<String>,
    last_error: Option<String>,
}

fn read_raw(row: &Row) -> Result<RawEntry, rusqlite::Error> {
    Ok(RawEntry {
        fingerprint: row.get("fingerprint")?,
        last_state: row.get("last_state")?,
        attempt_count: row.get("attempt_count")?,
        last_attempt_at: row.get("last_attempt_at")?,
        file_path: row.get("file_path")?,
        remote_id: row.get("remote_id")?,
        last_error: row.get("last_error")?,
    })
}

impl RawEntry {
    fn into_entry(self) -> Result<LedgerEntry> {
        Ok(LedgerEntry {
            content_fingerprint: Fingerprint::from_hex(self.fingerprint),
            last_state: parse_state(&self.last_state)?,
            attempt_count: to_u32(self.attempt_count, "attempt_count")?,
            last_attempt_at: parse_optional_datetime(self.last_attempt_at, "last_attempt_at")?,
            file_path: self.file_path,
            remote_id: self.remote_id,
            last_error: self.last_error,
        })
    }
}

impl Database {
    pub async fn get_ledger_entry(&self, fingerprint: &Fingerprint) -> Result<Option<LedgerEntry>> {
        let fingerprint = fingerprint.as_str().to_string();
        self.execute(move |conn| {
            let raw = conn
                .query_row(
                    "SELECT fingerprint, last_state, attempt_count, last_attempt_at,
                            file_path, remote_id, last_error
                     FROM ledger_entries
                     WHERE fingerprint = ?1",
                    params![fingerprint],
                    read_raw,
                )
                .optional()
                .context("failed to query ledger entry")?;

            raw.map(RawEntry::into_entry).transpose()
        })
        .await
    }

    /// Writes `entry` unless the stored row is already terminal. Read and
    /// write share one transaction on the ledger thread.
    pub async fn upsert_ledger_entry(&self, entry: &LedgerEntry) -> Result<UpsertOutcome> {
        let record = entry.clone();
        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open ledger transaction")?;

            let existing: Option<String> = tx
                .query_row(
                    "SELECT last_state FROM ledger_entries WHERE fingerprint = ?1",
                    params![record.content_fingerprint.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing) = existing {
                let existing = parse_state(&existing)?;
                if existing.is_terminal() {
                    if existing != record.last_state {
                        warn!(
                            "ledger entry {} is already {existing}; ignoring {}",
                            record.content_fingerprint.short(),
                            record.last_state
                        );
                    }
                    return Ok(UpsertOutcome::Unchanged);
                }
            }

            let now = Utc::now().to_rfc3339();
            tx.execute(
                "INSERT INTO ledger_entries (
                    fingerprint, last_state, attempt_count, last_attempt_at,
                    file_path, remote_id, last_error, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                    last_state = excluded.last_state,
                    attempt_count = excluded.attempt_count,
                    last_attempt_at = excluded.last_attempt_at,
                    file_path = COALESCE(excluded.file_path, ledger_entries.file_path),
                    remote_id = excluded.remote_id,
                    last_error = excluded.last_error,
                    updated_at = excluded.updated_at",
                params![
                    record.content_fingerprint.as_str(),
                    record.last_state.as_str(),
                    to_i64(u64::from(record.attempt_count))?,
                    record.last_attempt_at.map(|dt| dt.to_rfc3339()),
                    record.file_path,
                    record.remote_id,
                    record.last_error,
                    now,
                ],
            )
            .context("failed to upsert ledger entry")?;

            tx.commit().context("failed to commit ledger entry")?;
            Ok(UpsertOutcome::Written)
        })
        .await
    }

    pub async fn ledger_state_counts(&self) -> Result<StateCounts> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT last_state, COUNT(*) FROM ledger_entries GROUP BY last_state",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut counts = StateCounts::default();
            for (state, count) in rows {
                let count = u64::try_from(count).unwrap_or(0);
                match parse_state(&state)? {
                    JobState::Succeeded => counts.succeeded = count,
                    JobState::FailedPermanent => counts.failed_permanent = count,
                    JobState::FailedRetryable => counts.failed_retryable = count,
                    _ => {}
                }
            }
            Ok(counts)
        })
        .await
    }

    /// Retention hook: drops `Succeeded` rows last touched before `cutoff`.
    pub async fn prune_succeeded_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.execute(move |conn| {
            let removed = conn
                .execute(
                    "DELETE FROM ledger_entries
                     WHERE last_state = ?1 AND updated_at < ?2",
                    params![JobState::Succeeded.as_str(), cutoff.to_rfc3339()],
                )
                .context("failed to prune ledger entries")?;
            Ok(removed)
        })
        .await
    }
}
