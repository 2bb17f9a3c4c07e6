//! In-memory read model rebuilt by folding journal records.
//!
//! `apply` never fails: records were validated before they were appended, so replay only has to
//! reproduce their effect. References to unknown entities are logged and skipped.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use warden_canon::Hash;

use crate::bundle::verify::VerifyOutcome;
use crate::clock::Timestamp;
use crate::completion::CompletionReceipt;
use crate::ids::{AttemptId, IdAllocator, WorkId};
use crate::journal::{JournalRecord, RunFinalizedRecord};
use crate::lease::AttemptBook;
use crate::ledger::{WorkLedger, WorkStatus};
use crate::permit::PermitRegistry;
use crate::records::RecordBook;
use crate::seal::SealRegistry;

/// One finalized run as indexed by the kernel. The manifest itself lives in the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEntry {
    pub run_id: String,
    pub run_hash: Hash,
    pub manifest_hash: Hash,
    pub attempt_id: AttemptId,
    pub work_id: WorkId,
    pub workspace_id: String,
    pub seal_hash: Hash,
    pub prev_run_hash: Option<Hash>,
    pub verdict: VerifyOutcome,
    pub finalized_at: Timestamp,
}

#[derive(Debug, Clone, Default)]
pub struct RunIndex {
    runs: BTreeMap<Hash, RunEntry>,
    order: Vec<Hash>,
    by_run_id: HashMap<String, Hash>,
    head_by_workspace: HashMap<String, Hash>,
}

impl RunIndex {
    pub fn get(&self, run_hash: &Hash) -> Option<&RunEntry> {
        self.runs.get(run_hash)
    }

    pub fn by_run_id(&self, run_id: &str) -> Option<&RunEntry> {
        self.by_run_id.get(run_id).and_then(|hash| self.runs.get(hash))
    }

    /// Latest run of a workspace; the next run chains to it.
    pub fn head(&self, workspace_id: &str) -> Option<Hash> {
        self.head_by_workspace.get(workspace_id).copied()
    }

    /// Runs in finalization order.
    pub fn iter(&self) -> impl Iterator<Item = &RunEntry> {
        self.order.iter().filter_map(|hash| self.runs.get(hash))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn insert(&mut self, record: &RunFinalizedRecord, work_id: WorkId) {
        if self.runs.contains_key(&record.run_hash) {
            return;
        }
        self.order.push(record.run_hash);
        self.by_run_id.insert(record.run_id.clone(), record.run_hash);
        self.head_by_workspace
            .insert(record.workspace_id.clone(), record.run_hash);
        self.runs.insert(
            record.run_hash,
            RunEntry {
                run_id: record.run_id.clone(),
                run_hash: record.run_hash,
                manifest_hash: record.manifest_hash,
                attempt_id: record.attempt_id,
                work_id,
                workspace_id: record.workspace_id.clone(),
                seal_hash: record.seal_hash,
                prev_run_hash: record.prev_run_hash,
                verdict: record.verdict,
                finalized_at: record.finalized_at,
            },
        );
    }
}

#[derive(Debug, Clone, Default)]
pub struct KernelState {
    pub ledger: WorkLedger,
    pub attempts: AttemptBook,
    pub records: RecordBook,
    pub seals: SealRegistry,
    pub permits: PermitRegistry,
    pub runs: RunIndex,
    pub receipts: BTreeMap<AttemptId, CompletionReceipt>,
    pub ids: IdAllocator,
    /// Refused writes seen in the journal.
    pub rejections: u64,
}

impl KernelState {
    pub fn apply(&mut self, record: &JournalRecord) {
        match record {
            JournalRecord::WorkItemCreated(created) => self.ledger.apply_created(created),
            JournalRecord::DependencyAdded(edge) => self.ledger.apply_dependency(edge),
            JournalRecord::WorkItemDeferred(change) => {
                self.ledger
                    .set_status(&change.work_id, WorkStatus::Deferred, change.changed_at)
            }
            JournalRecord::WorkItemResumed(change) => {
                self.ledger
                    .set_status(&change.work_id, WorkStatus::Pending, change.changed_at)
            }
            JournalRecord::WorkItemDeleted(change) => self.ledger.apply_deleted(change),
            JournalRecord::AttemptClaimed(claimed) => {
                self.ids.observe_attempt(claimed.attempt_id);
                self.attempts.apply_claimed(claimed, &mut self.ledger);
            }
            JournalRecord::LeaseRenewed(renewed) => {
                if self.known_attempt(renewed.attempt_id, "lease_renewed") {
                    self.attempts.apply_renewed(renewed);
                }
            }
            JournalRecord::LeaseExpired(expired) => {
                if self.known_attempt(expired.attempt_id, "lease_expired") {
                    self.attempts.apply_expired(expired, &mut self.ledger);
                }
            }
            JournalRecord::AttemptHandedOff(handoff) => {
                self.ids.observe_attempt(handoff.successor_id);
                if self.known_attempt(handoff.attempt_id, "attempt_handed_off") {
                    self.attempts.apply_handed_off(handoff);
                }
            }
            JournalRecord::AttemptBlocked(blocked) => {
                self.ids.observe_blocker(blocked.blocker.id);
                self.records.insert_blocker(&blocked.blocker);
                if self.known_attempt(blocked.attempt_id, "attempt_blocked") {
                    self.attempts.apply_blocked(blocked, &mut self.ledger);
                }
            }
            JournalRecord::AttemptAbandoned(abandoned) => {
                if self.known_attempt(abandoned.attempt_id, "attempt_abandoned") {
                    self.attempts.apply_abandoned(abandoned, &mut self.ledger);
                }
            }
            JournalRecord::AttemptCompleted(completed) => {
                if self.known_attempt(completed.attempt_id, "attempt_completed") {
                    self.attempts.apply_completed(completed, &mut self.ledger);
                    self.receipts
                        .insert(completed.attempt_id, completed.receipt.clone());
                }
            }
            JournalRecord::OutcomeRecorded(outcome) => self.records.insert_outcome(outcome),
            JournalRecord::EvidenceRecorded(evidence) => {
                self.ids.observe_evidence(evidence.id);
                self.records.insert_evidence(evidence);
            }
            JournalRecord::DecisionRecorded(decision) => {
                self.ids.observe_decision(decision.id);
                self.records.insert_decision(decision);
            }
            JournalRecord::BlockerResolved(resolved) => {
                match self
                    .records
                    .resolve_blocker(resolved.blocker_id, &resolved.resolution)
                {
                    Some(work_id) => self.attempts.apply_blocker_resolved(
                        &work_id,
                        &resolved.resolution,
                        &self.records,
                        &mut self.ledger,
                    ),
                    None => log::warn!(
                        "blocker_resolved references unknown blocker {}",
                        resolved.blocker_id
                    ),
                }
            }
            JournalRecord::GateExceptionGranted(exception) => {
                if self.known_attempt(exception.attempt_id, "gate_exception_granted") {
                    self.records.insert_exception(exception);
                }
            }
            JournalRecord::PlanSealed(seal) => {
                self.seals.apply_sealed(seal);
                self.attempts.attach_seal(seal.plan.attempt_id, seal.plan_hash);
            }
            JournalRecord::PermitIssued(permit) => self.permits.apply_issued(permit),
            JournalRecord::PermitConsumed(consumed) => {
                self.permits.apply_consumed(consumed.permit_id)
            }
            JournalRecord::ActionDenied(denied) => self.permits.apply_denied(denied),
            JournalRecord::RunFinalized(run) => self.apply_run(run),
            JournalRecord::Rejected(_) => self.rejections += 1,
        }
    }

    fn apply_run(&mut self, run: &RunFinalizedRecord) {
        let Some(work_id) = self
            .attempts
            .get(run.attempt_id)
            .map(|attempt| attempt.work_id.clone())
        else {
            log::warn!("run_finalized references unknown attempt {}", run.attempt_id);
            return;
        };
        self.seals.apply_finalized(run.attempt_id, &run.seal_hash);
        self.attempts.attach_run(run.attempt_id, run.run_hash);
        self.ids.observe_evidence(run.evidence.id);
        self.records.insert_evidence(&run.evidence);
        self.runs.insert(run, work_id);
    }

    fn known_attempt(&self, attempt_id: AttemptId, record: &str) -> bool {
        let known = self.attempts.get(attempt_id).is_some();
        if !known {
            log::warn!("{record} references unknown attempt {attempt_id}");
        }
        known
    }
}
