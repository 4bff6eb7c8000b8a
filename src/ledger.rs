//! Upload ledger: persisted per-fingerprint state plus the in-process claim
//! table that keeps a fingerprint to one in-flight job.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::Result;

use crate::db::{Database, LedgerEntry, StateCounts, UpsertOutcome};
use crate::fingerprint::Fingerprint;

#[derive(Clone)]
pub struct UploadLedger {
    db: Database,
    in_flight: Arc<Mutex<HashSet<Fingerprint>>>,
}

/// Result of trying to take ownership of a fingerprint.
#[derive(Debug)]
pub enum Claim {
    /// The caller owns the fingerprint until the guard is dropped. Carries the
    /// previous non-terminal ledger entry, if any.
    Acquired(ClaimGuard, Option<LedgerEntry>),
    /// A terminal entry exists; the content was handled before.
    AlreadyHandled(LedgerEntry),
    /// Another job holds the fingerprint right now.
    InFlight,
}

/// Releases the in-flight slot on drop.
#[derive(Debug)]
pub struct ClaimGuard {
    fingerprint: Fingerprint,
    in_flight: Arc<Mutex<HashSet<Fingerprint>>>,
}

impl ClaimGuard {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.fingerprint);
    }
}

impl UploadLedger {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<LedgerEntry>> {
        self.db.get_ledger_entry(fingerprint).await
    }

    /// Durable once this returns. Same-state upserts over a terminal entry are
    /// no-ops.
    pub async fn upsert(&self, entry: &LedgerEntry) -> Result<UpsertOutcome> {
        self.db.upsert_ledger_entry(entry).await
    }

    /// Lookup-then-claim for one fingerprint. The in-flight slot is taken
    /// before the ledger is read, so two callers racing on the same content
    /// cannot both see "not uploaded yet".
    pub async fn claim(&self, fingerprint: &Fingerprint) -> Result<Claim> {
        {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !in_flight.insert(fingerprint.clone()) {
                return Ok(Claim::InFlight);
            }
        }

        let guard = ClaimGuard {
            fingerprint: fingerprint.clone(),
            in_flight: Arc::clone(&self.in_flight),
        };

        match self.db.get_ledger_entry(fingerprint).await? {
            Some(entry) if entry.is_terminal() => Ok(Claim::AlreadyHandled(entry)),
            previous => Ok(Claim::Acquired(guard, previous)),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub async fn state_counts(&self) -> Result<StateCounts> {
        self.db.ledger_state_counts().await
    }

    pub async fn prune_succeeded_before(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<usize> {
        self.db.prune_succeeded_before(cutoff).await
    }
}
