//! Append-only audit log.
//!
//! Every mutation of kernel state is a [`JournalRecord`] appended here before it is applied.
//! Entries carry a chain hash over the previous entry so rewriting history is detectable, and the
//! full log can be replayed to rebuild state after a restart.

pub mod fs;
pub mod mem;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_canon::Hash;

use crate::bundle::verify::VerifyOutcome;
use crate::clock::Timestamp;
use crate::completion::{CompletionReceipt, GateException};
use crate::ids::{AttemptId, WorkId};
use crate::ledger::Requirements;
use crate::permit::{Permit, UnpermittedAttempt};
use crate::records::{Blocker, BlockerResolution, Decision, EvidenceRecord, OutcomeRecord};
use crate::seal::PlanSeal;

/// Monotonic cursor assigned to every persisted journal entry.
pub type JournalSeq = u64;

/// Coarse classification of a journal entry, stored next to the payload so readers can filter
/// without decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    WorkItem,
    Attempt,
    Outcome,
    Evidence,
    Decision,
    Blocker,
    Exception,
    Seal,
    Permit,
    Run,
    Rejection,
}

impl JournalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalKind::WorkItem => "work_item",
            JournalKind::Attempt => "attempt",
            JournalKind::Outcome => "outcome",
            JournalKind::Evidence => "evidence",
            JournalKind::Decision => "decision",
            JournalKind::Blocker => "blocker",
            JournalKind::Exception => "exception",
            JournalKind::Seal => "seal",
            JournalKind::Permit => "permit",
            JournalKind::Run => "run",
            JournalKind::Rejection => "rejection",
        }
    }
}

/// Type-safe payloads for every state transition. Serialized as canonical JSON into the entry
/// payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "record_kind", rename_all = "snake_case")]
pub enum JournalRecord {
    WorkItemCreated(WorkItemCreatedRecord),
    DependencyAdded(DependencyAddedRecord),
    WorkItemDeferred(WorkItemChangeRecord),
    WorkItemResumed(WorkItemChangeRecord),
    WorkItemDeleted(WorkItemChangeRecord),
    AttemptClaimed(AttemptClaimedRecord),
    LeaseRenewed(LeaseRenewedRecord),
    LeaseExpired(LeaseExpiredRecord),
    AttemptHandedOff(AttemptHandedOffRecord),
    AttemptBlocked(AttemptBlockedRecord),
    AttemptAbandoned(AttemptAbandonedRecord),
    AttemptCompleted(AttemptCompletedRecord),
    OutcomeRecorded(OutcomeRecord),
    EvidenceRecorded(EvidenceRecord),
    DecisionRecorded(Decision),
    BlockerResolved(BlockerResolvedRecord),
    GateExceptionGranted(GateException),
    PlanSealed(PlanSeal),
    PermitIssued(Permit),
    PermitConsumed(PermitConsumedRecord),
    ActionDenied(UnpermittedAttempt),
    RunFinalized(RunFinalizedRecord),
    Rejected(RejectedRecord),
}

impl JournalRecord {
    pub fn kind(&self) -> JournalKind {
        match self {
            JournalRecord::WorkItemCreated(_)
            | JournalRecord::DependencyAdded(_)
            | JournalRecord::WorkItemDeferred(_)
            | JournalRecord::WorkItemResumed(_)
            | JournalRecord::WorkItemDeleted(_) => JournalKind::WorkItem,
            JournalRecord::AttemptClaimed(_)
            | JournalRecord::LeaseRenewed(_)
            | JournalRecord::LeaseExpired(_)
            | JournalRecord::AttemptHandedOff(_)
            | JournalRecord::AttemptBlocked(_)
            | JournalRecord::AttemptAbandoned(_)
            | JournalRecord::AttemptCompleted(_) => JournalKind::Attempt,
            JournalRecord::OutcomeRecorded(_) => JournalKind::Outcome,
            JournalRecord::EvidenceRecorded(_) => JournalKind::Evidence,
            JournalRecord::DecisionRecorded(_) => JournalKind::Decision,
            JournalRecord::BlockerResolved(_) => JournalKind::Blocker,
            JournalRecord::GateExceptionGranted(_) => JournalKind::Exception,
            JournalRecord::PlanSealed(_) => JournalKind::Seal,
            JournalRecord::PermitIssued(_)
            | JournalRecord::PermitConsumed(_)
            | JournalRecord::ActionDenied(_) => JournalKind::Permit,
            JournalRecord::RunFinalized(_) => JournalKind::Run,
            JournalRecord::Rejected(_) => JournalKind::Rejection,
        }
    }

    /// Decode the payload of a stored entry, checking that the declared kind matches.
    pub fn decode(entry: &OwnedJournalEntry) -> Result<Self, JournalError> {
        let record: JournalRecord = serde_json::from_slice(&entry.payload)
            .map_err(|err| JournalError::Decode(format!("entry {}: {err}", entry.seq)))?;
        if record.kind() != entry.kind {
            return Err(JournalError::Corrupt(format!(
                "entry {} declares kind '{}' but holds a '{}' record",
                entry.seq,
                entry.kind.as_str(),
                record.kind().as_str()
            )));
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItemCreatedRecord {
    pub work_id: WorkId,
    pub title: String,
    #[serde(default)]
    pub requirements: Requirements,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyAddedRecord {
    pub work_id: WorkId,
    pub depends_on: WorkId,
    pub added_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItemChangeRecord {
    pub work_id: WorkId,
    pub changed_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptClaimedRecord {
    pub attempt_id: AttemptId,
    pub work_id: WorkId,
    pub claimant: String,
    pub claimed_at: Timestamp,
    pub lease_expires_at: Timestamp,
    pub contract_hash: Hash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseRenewedRecord {
    pub attempt_id: AttemptId,
    pub renewed_at: Timestamp,
    pub lease_expires_at: Timestamp,
}

/// Written by the lazy expiry sweep when an open lease is found past its expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseExpiredRecord {
    pub attempt_id: AttemptId,
    pub work_id: WorkId,
    pub expired_at: Timestamp,
    pub observed_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptHandedOffRecord {
    pub attempt_id: AttemptId,
    pub successor_id: AttemptId,
    pub to_claimant: String,
    pub reason: String,
    pub handed_off_at: Timestamp,
    pub lease_expires_at: Timestamp,
    #[serde(default)]
    pub expired_release: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptBlockedRecord {
    pub attempt_id: AttemptId,
    pub blocker: Blocker,
    #[serde(default)]
    pub expired_release: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptAbandonedRecord {
    pub attempt_id: AttemptId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub abandoned_at: Timestamp,
    #[serde(default)]
    pub expired_release: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptCompletedRecord {
    pub attempt_id: AttemptId,
    pub receipt_hash: Hash,
    pub receipt: CompletionReceipt,
    #[serde(default)]
    pub expired_release: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockerResolvedRecord {
    pub blocker_id: crate::ids::BlockerId,
    pub resolution: BlockerResolution,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermitConsumedRecord {
    pub attempt_id: AttemptId,
    pub permit_id: Hash,
    pub consumed_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunFinalizedRecord {
    pub attempt_id: AttemptId,
    pub run_id: String,
    pub run_hash: Hash,
    /// Store node holding the full manifest.
    pub manifest_hash: Hash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_run_hash: Option<Hash>,
    pub workspace_id: String,
    pub seal_hash: Hash,
    pub verdict: VerifyOutcome,
    pub evidence: EvidenceRecord,
    pub finalized_at: Timestamp,
}

/// A write that was refused. Kept so the audit log shows every attempted state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RejectedRecord {
    pub operation: String,
    pub code: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<AttemptId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_id: Option<WorkId>,
    pub rejected_at: Timestamp,
}

/// Borrowed entry handed to [`Journal::append`].
#[derive(Debug, Clone, Copy)]
pub struct JournalEntry<'a> {
    pub kind: JournalKind,
    pub payload: &'a [u8],
}

impl<'a> JournalEntry<'a> {
    pub fn new(kind: JournalKind, payload: &'a [u8]) -> Self {
        Self { kind, payload }
    }
}

/// Owned entry returned by journal readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedJournalEntry {
    pub seq: JournalSeq,
    pub kind: JournalKind,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Chain hash over the previous entry's chain hash and this entry's content.
    pub chain: Hash,
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("corrupt entry: {0}")]
    Corrupt(String),
    #[error("journal chain broken at entry {seq}: expected {expected}, found {found}")]
    ChainBroken {
        seq: JournalSeq,
        expected: Hash,
        found: Hash,
    },
    #[error("failed to decode record: {0}")]
    Decode(String),
    #[error("journal lock poisoned")]
    Poisoned,
}

pub trait Journal: Send + Sync {
    fn append(&mut self, entry: JournalEntry<'_>) -> Result<JournalSeq, JournalError>;

    /// Loads entries starting at `from` (inclusive). Passing 0 returns the full log.
    fn load_from(&self, from: JournalSeq) -> Result<Vec<OwnedJournalEntry>, JournalError>;

    /// Returns the next sequence that will be assigned on append.
    fn next_seq(&self) -> JournalSeq;
}

/// Chain value preceding the first entry.
pub const GENESIS_CHAIN: Hash = Hash::ZERO;

/// Chain hash of an entry given its predecessor's chain hash.
pub fn chain_hash(prev: &Hash, seq: JournalSeq, kind: JournalKind, payload: &[u8]) -> Hash {
    let kind = kind.as_str().as_bytes();
    let mut buf = Vec::with_capacity(32 + 8 + kind.len() + 1 + payload.len());
    buf.extend_from_slice(prev.as_bytes());
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(kind);
    buf.push(0);
    buf.extend_from_slice(payload);
    Hash::of_bytes(&buf)
}

/// Walk a contiguous run of entries (starting at seq 0) and confirm every chain link.
pub fn verify_chain(entries: &[OwnedJournalEntry]) -> Result<Hash, JournalError> {
    let mut prev = GENESIS_CHAIN;
    for (idx, entry) in entries.iter().enumerate() {
        if entry.seq != idx as JournalSeq {
            return Err(JournalError::Corrupt(format!(
                "expected seq {idx}, found {}",
                entry.seq
            )));
        }
        let expected = chain_hash(&prev, entry.seq, entry.kind, &entry.payload);
        if expected != entry.chain {
            return Err(JournalError::ChainBroken {
                seq: entry.seq,
                expected,
                found: entry.chain,
            });
        }
        prev = entry.chain;
    }
    Ok(prev)
}

/// Helper used by on-disk implementations to encode entries in a stable layout.
#[derive(Serialize)]
struct DiskRecord<'a> {
    seq: JournalSeq,
    kind: JournalKind,
    #[serde(with = "serde_bytes")]
    payload: &'a [u8],
    chain: Hash,
}
