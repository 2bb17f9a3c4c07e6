//! Attempt/Lease manager.
//!
//! States: `none -> open -> {handed_off | blocked | completed | abandoned}`. This module is the
//! only place that moves a work item between `pending`, `in_progress`, `blocked` and `completed`.
//! Expiry is evaluated lazily against the caller's clock reading; nothing runs in the background.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use warden_canon::Hash;

use crate::clock::Timestamp;
use crate::error::{CoordError, Unmet, Violation};
use crate::ids::{AttemptId, WorkId};
use crate::journal::{
    AttemptAbandonedRecord, AttemptBlockedRecord, AttemptClaimedRecord, AttemptCompletedRecord,
    AttemptHandedOffRecord, LeaseExpiredRecord, LeaseRenewedRecord,
};
use crate::ledger::{WorkLedger, WorkStatus};
use crate::records::{BlockerResolution, RecordBook};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Open,
    HandedOff,
    Blocked,
    Completed,
    Abandoned,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Open => "open",
            Disposition::HandedOff => "handed_off",
            Disposition::Blocked => "blocked",
            Disposition::Completed => "completed",
            Disposition::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Disposition::Open)
    }
}

/// Time-bounded capability backing an open attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub attempt_id: AttemptId,
    pub granted_at: Timestamp,
    pub expires_at: Timestamp,
    pub renewals: u32,
    /// Source snapshot at claim time, used for rollback and recovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<Timestamp>,
}

impl Lease {
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: AttemptId,
    pub work_id: WorkId,
    pub claimant: String,
    pub claimed_at: Timestamp,
    pub disposition: Disposition,
    pub lease: Lease,
    pub contract_hash: Hash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker: Option<crate::ids::BlockerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<AttemptId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successor: Option<AttemptId>,
    #[serde(default)]
    pub seals: Vec<Hash>,
    #[serde(default)]
    pub runs: Vec<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_reason: Option<String>,
    /// Set when the attempt ended because the lease lapsed.
    #[serde(default)]
    pub expired: bool,
    /// Set when the release arrived after the lease had already lapsed.
    #[serde(default)]
    pub expired_release: bool,
}

impl Attempt {
    pub fn is_open(&self) -> bool {
        self.disposition == Disposition::Open
    }

    pub fn latest_run(&self) -> Option<Hash> {
        self.runs.last().copied()
    }

    fn close(&mut self, disposition: Disposition, at: Timestamp, expired_release: bool) {
        self.disposition = disposition;
        self.lease.ended_at = Some(at);
        self.expired_release = expired_release;
    }
}

/// Outcome of a claim check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClaimCheck {
    Grant,
    /// The requesting claimant already holds the open attempt.
    Existing(AttemptId),
}

#[derive(Debug, Clone, Default)]
pub struct AttemptBook {
    attempts: BTreeMap<AttemptId, Attempt>,
    open_by_work: HashMap<WorkId, AttemptId>,
}

impl AttemptBook {
    pub fn get(&self, id: AttemptId) -> Option<&Attempt> {
        self.attempts.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attempt> {
        self.attempts.values()
    }

    pub fn open_for(&self, work_id: &WorkId) -> Option<&Attempt> {
        self.open_by_work
            .get(work_id)
            .and_then(|id| self.attempts.get(id))
    }

    pub fn for_work(&self, work_id: &WorkId) -> Vec<&Attempt> {
        self.attempts
            .values()
            .filter(|attempt| &attempt.work_id == work_id)
            .collect()
    }

    /// Open attempt whose lease has lapsed, if any.
    pub(crate) fn lapsed(&self, attempt_id: AttemptId, now: Timestamp) -> Option<&Attempt> {
        self.attempts
            .get(&attempt_id)
            .filter(|attempt| attempt.is_open() && attempt.lease.is_expired_at(now))
    }

    pub(crate) fn lapsed_for_work(&self, work_id: &WorkId, now: Timestamp) -> Option<&Attempt> {
        self.open_for(work_id)
            .filter(|attempt| attempt.lease.is_expired_at(now))
    }

    /// Claim guard. Lapsed leases must be swept before calling this.
    pub(crate) fn check_claim(
        &self,
        ledger: &WorkLedger,
        records: &RecordBook,
        work_id: &WorkId,
        claimant: &str,
    ) -> Result<ClaimCheck, CoordError> {
        if claimant.trim().is_empty() {
            return Err(Violation::invalid("claimant", "must not be empty").into());
        }
        if let Some(open) = self.open_for(work_id) {
            if open.claimant == claimant {
                return Ok(ClaimCheck::Existing(open.id));
            }
            return Err(Violation::AlreadyClaimed {
                work_id: work_id.clone(),
                attempt_id: open.id,
                claimant: open.claimant.clone(),
            }
            .into());
        }
        let mut unmet = ledger.claim_blockers(work_id);
        unmet.extend(
            records
                .open_blockers(work_id)
                .into_iter()
                .map(|blocker| Unmet::OpenBlocker {
                    blocker_id: blocker.id,
                }),
        );
        if !unmet.is_empty() {
            return Err(Violation::missing(unmet).into());
        }
        Ok(ClaimCheck::Grant)
    }

    /// The attempt must exist and be open.
    pub(crate) fn check_open(&self, attempt_id: AttemptId) -> Result<&Attempt, CoordError> {
        let attempt = self.check_exists(attempt_id)?;
        if !attempt.is_open() {
            return Err(Violation::AttemptNotOpen {
                attempt_id,
                disposition: attempt.disposition,
            }
            .into());
        }
        Ok(attempt)
    }

    pub(crate) fn check_exists(&self, attempt_id: AttemptId) -> Result<&Attempt, CoordError> {
        self.attempts
            .get(&attempt_id)
            .ok_or_else(|| Violation::AttemptNotFound { attempt_id }.into())
    }

    /// `complete` guard: at least one evidence record must already be attached.
    pub(crate) fn check_complete(
        &self,
        records: &RecordBook,
        attempt_id: AttemptId,
    ) -> Result<(), CoordError> {
        if records.evidence_for(attempt_id).is_empty() {
            return Err(Violation::EvidenceRequired { attempt_id }.into());
        }
        Ok(())
    }

    pub(crate) fn check_handoff(
        &self,
        attempt: &Attempt,
        to_claimant: &str,
        reason: &str,
    ) -> Result<(), CoordError> {
        let mut unmet = Vec::new();
        if to_claimant.trim().is_empty() {
            unmet.push(Unmet::HandoffTarget);
        }
        if reason.trim().is_empty() {
            unmet.push(Unmet::HandoffReason);
        }
        if !unmet.is_empty() {
            return Err(Violation::missing(unmet).into());
        }
        if attempt.claimant == to_claimant {
            return Err(Violation::invalid(
                "to_claimant",
                format!("{} already holds {}", to_claimant, attempt.id),
            )
            .into());
        }
        Ok(())
    }

    pub(crate) fn apply_claimed(&mut self, record: &AttemptClaimedRecord, ledger: &mut WorkLedger) {
        let attempt = Attempt {
            id: record.attempt_id,
            work_id: record.work_id.clone(),
            claimant: record.claimant.clone(),
            claimed_at: record.claimed_at,
            disposition: Disposition::Open,
            lease: Lease {
                attempt_id: record.attempt_id,
                granted_at: record.claimed_at,
                expires_at: record.lease_expires_at,
                renewals: 0,
                baseline: record.baseline.clone(),
                ended_at: None,
            },
            contract_hash: record.contract_hash,
            blocker: None,
            predecessor: None,
            successor: None,
            seals: Vec::new(),
            runs: Vec::new(),
            receipt: None,
            release_reason: None,
            expired: false,
            expired_release: false,
        };
        self.open_by_work
            .insert(record.work_id.clone(), record.attempt_id);
        self.attempts.insert(record.attempt_id, attempt);
        ledger.set_status(&record.work_id, WorkStatus::InProgress, record.claimed_at);
    }

    pub(crate) fn apply_renewed(&mut self, record: &LeaseRenewedRecord) {
        if let Some(attempt) = self.attempts.get_mut(&record.attempt_id) {
            attempt.lease.expires_at = record.lease_expires_at;
            attempt.lease.renewals += 1;
        }
    }

    pub(crate) fn apply_expired(&mut self, record: &LeaseExpiredRecord, ledger: &mut WorkLedger) {
        if let Some(attempt) = self.attempts.get_mut(&record.attempt_id) {
            attempt.close(Disposition::Abandoned, record.observed_at, false);
            attempt.expired = true;
            attempt.release_reason = Some("lease expired".into());
            self.open_by_work.remove(&record.work_id);
            ledger.set_status(&record.work_id, WorkStatus::Pending, record.observed_at);
        }
    }

    pub(crate) fn apply_handed_off(&mut self, record: &AttemptHandedOffRecord) {
        let Some(previous) = self.attempts.get_mut(&record.attempt_id) else {
            return;
        };
        previous.close(
            Disposition::HandedOff,
            record.handed_off_at,
            record.expired_release,
        );
        previous.successor = Some(record.successor_id);
        previous.release_reason = Some(record.reason.clone());
        let successor = Attempt {
            id: record.successor_id,
            work_id: previous.work_id.clone(),
            claimant: record.to_claimant.clone(),
            claimed_at: record.handed_off_at,
            disposition: Disposition::Open,
            lease: Lease {
                attempt_id: record.successor_id,
                granted_at: record.handed_off_at,
                expires_at: record.lease_expires_at,
                renewals: 0,
                baseline: previous.lease.baseline.clone(),
                ended_at: None,
            },
            contract_hash: previous.contract_hash,
            blocker: None,
            predecessor: Some(previous.id),
            successor: None,
            seals: Vec::new(),
            runs: Vec::new(),
            receipt: None,
            release_reason: None,
            expired: false,
            expired_release: false,
        };
        self.open_by_work
            .insert(successor.work_id.clone(), successor.id);
        self.attempts.insert(successor.id, successor);
    }

    pub(crate) fn apply_blocked(&mut self, record: &AttemptBlockedRecord, ledger: &mut WorkLedger) {
        if let Some(attempt) = self.attempts.get_mut(&record.attempt_id) {
            attempt.close(
                Disposition::Blocked,
                record.blocker.raised_at,
                record.expired_release,
            );
            attempt.blocker = Some(record.blocker.id);
            attempt.release_reason = Some(record.blocker.reason.clone());
            self.open_by_work.remove(&attempt.work_id);
            ledger.set_status(&attempt.work_id, WorkStatus::Blocked, record.blocker.raised_at);
        }
    }

    pub(crate) fn apply_abandoned(
        &mut self,
        record: &AttemptAbandonedRecord,
        ledger: &mut WorkLedger,
    ) {
        if let Some(attempt) = self.attempts.get_mut(&record.attempt_id) {
            attempt.close(
                Disposition::Abandoned,
                record.abandoned_at,
                record.expired_release,
            );
            attempt.release_reason = record.reason.clone();
            self.open_by_work.remove(&attempt.work_id);
            ledger.set_status(&attempt.work_id, WorkStatus::Pending, record.abandoned_at);
        }
    }

    pub(crate) fn apply_completed(
        &mut self,
        record: &AttemptCompletedRecord,
        ledger: &mut WorkLedger,
    ) {
        if let Some(attempt) = self.attempts.get_mut(&record.attempt_id) {
            let at = record.receipt.completed_at;
            attempt.close(Disposition::Completed, at, record.expired_release);
            attempt.receipt = Some(record.receipt_hash);
            self.open_by_work.remove(&attempt.work_id);
            ledger.set_status(&attempt.work_id, WorkStatus::Completed, at);
        }
    }

    /// A resolved blocker returns its work item to `pending` once nothing else blocks it.
    pub(crate) fn apply_blocker_resolved(
        &self,
        work_id: &WorkId,
        resolution: &BlockerResolution,
        records: &RecordBook,
        ledger: &mut WorkLedger,
    ) {
        let still_blocked = !records.open_blockers(work_id).is_empty();
        let is_blocked = ledger
            .get(work_id)
            .is_some_and(|item| item.status == WorkStatus::Blocked);
        if is_blocked && !still_blocked {
            ledger.set_status(work_id, WorkStatus::Pending, resolution.resolved_at);
        }
    }

    pub(crate) fn attach_seal(&mut self, attempt_id: AttemptId, plan_hash: Hash) {
        if let Some(attempt) = self.attempts.get_mut(&attempt_id) {
            if !attempt.seals.contains(&plan_hash) {
                attempt.seals.push(plan_hash);
            }
        }
    }

    pub(crate) fn attach_run(&mut self, attempt_id: AttemptId, run_hash: Hash) {
        if let Some(attempt) = self.attempts.get_mut(&attempt_id) {
            attempt.runs.push(run_hash);
        }
    }
}
