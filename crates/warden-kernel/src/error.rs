use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_canon::{CanonError, Hash};
use warden_store::StoreError;

use crate::clock::Timestamp;
use crate::bundle::BundleError;
use crate::completion::CompletionFailure;
use crate::config::ConfigError;
use crate::ids::{AttemptId, BlockerId, EvidenceId, WorkId};
use crate::journal::JournalError;
use crate::lease::Disposition;
use crate::ledger::WorkStatus;
use crate::permit::PermitDenial;
use crate::records::ArtifactKind;
use crate::seal::SealViolation;

pub type CoordResult<T> = Result<T, CoordError>;

/// Infrastructure faults. Retryable by the caller with the same input.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("canonical encoding error: {0}")]
    Canon(#[from] CanonError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("signing error: {0}")]
    Signing(String),
    #[error("head source error: {0}")]
    Head(String),
    #[error("replay failed at entry {seq}: {message}")]
    Replay { seq: u64, message: String },
    #[error("kernel state lock poisoned")]
    LockPoisoned,
}

/// One named condition that keeps an operation from proceeding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unmet", rename_all = "snake_case")]
pub enum Unmet {
    WorkItemNotFound { work_id: WorkId },
    WorkItemDeleted { work_id: WorkId },
    WorkItemCompleted { work_id: WorkId },
    WorkItemDeferred { work_id: WorkId },
    Dependency { work_id: WorkId, status: WorkStatus },
    OpenBlocker { blocker_id: BlockerId },
    AttemptNotFound { attempt_id: AttemptId },
    LeaseExpired { attempt_id: AttemptId, expired_at: Timestamp },
    Evidence { kind: ArtifactKind },
    EvidenceNotFound { evidence_id: EvidenceId },
    Artifact { hash: Hash },
    Standard { id: String },
    PlanSeal { attempt_id: AttemptId },
    HandoffReason,
    HandoffTarget,
    BlockerReason,
    ResolutionJustification,
}

impl std::fmt::Display for Unmet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unmet::WorkItemNotFound { work_id } => write!(f, "work item {work_id} does not exist"),
            Unmet::WorkItemDeleted { work_id } => write!(f, "work item {work_id} is deleted"),
            Unmet::WorkItemCompleted { work_id } => {
                write!(f, "work item {work_id} is already completed")
            }
            Unmet::WorkItemDeferred { work_id } => write!(f, "work item {work_id} is deferred"),
            Unmet::Dependency { work_id, status } => {
                write!(f, "dependency {work_id} is {}", status.as_str())
            }
            Unmet::OpenBlocker { blocker_id } => write!(f, "blocker {blocker_id} is unresolved"),
            Unmet::AttemptNotFound { attempt_id } => write!(f, "attempt {attempt_id} not found"),
            Unmet::LeaseExpired {
                attempt_id,
                expired_at,
            } => write!(f, "lease of {attempt_id} expired at {expired_at}"),
            Unmet::Evidence { kind } => write!(f, "no {} evidence recorded", kind.as_str()),
            Unmet::EvidenceNotFound { evidence_id } => {
                write!(f, "evidence {evidence_id} not found")
            }
            Unmet::Artifact { hash } => write!(f, "artifact {hash} is not stored"),
            Unmet::Standard { id } => write!(f, "standard '{id}' is not in the catalog"),
            Unmet::PlanSeal { attempt_id } => write!(f, "{attempt_id} has no active plan seal"),
            Unmet::HandoffReason => f.write_str("handoff requires a reason"),
            Unmet::HandoffTarget => f.write_str("handoff requires a target claimant"),
            Unmet::BlockerReason => f.write_str("block requires a blocker reason"),
            Unmet::ResolutionJustification => {
                f.write_str("blocker resolution requires a justification")
            }
        }
    }
}

/// Structured list of everything unmet. Never empty when returned as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingPrereqs {
    pub unmet: Vec<Unmet>,
}

impl MissingPrereqs {
    pub fn one(unmet: Unmet) -> Self {
        Self { unmet: vec![unmet] }
    }
}

impl std::fmt::Display for MissingPrereqs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (idx, item) in self.unmet.iter().enumerate() {
            if idx > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{item}")?;
        }
        Ok(())
    }
}

/// Expected, caller-recoverable refusals.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("work item {work_id} is already claimed by {claimant} ({attempt_id})")]
    AlreadyClaimed {
        work_id: WorkId,
        attempt_id: AttemptId,
        claimant: String,
    },
    #[error("missing prerequisites: {0}")]
    MissingPrereqs(MissingPrereqs),
    #[error("{attempt_id} has no evidence recorded")]
    EvidenceRequired { attempt_id: AttemptId },
    #[error("{attempt_id} is {} and no longer open", disposition.as_str())]
    AttemptNotOpen {
        attempt_id: AttemptId,
        disposition: Disposition,
    },
    #[error("attempt {attempt_id} not found")]
    AttemptNotFound { attempt_id: AttemptId },
    #[error("work item {work_id} not found")]
    WorkItemNotFound { work_id: WorkId },
    #[error("invalid artifact type '{kind}'")]
    InvalidArtifactType { kind: String },
    #[error("invalid {field}: {reason}")]
    InvalidRequest { field: String, reason: String },
    #[error("{code}: {0}", code = .0.code())]
    Seal(SealViolation),
    #[error("{code}: {0}", code = .0.code())]
    Permit(PermitDenial),
    #[error("{code}: {0}", code = .0.code())]
    Completion(CompletionFailure),
}

impl Violation {
    pub fn code(&self) -> &'static str {
        match self {
            Violation::AlreadyClaimed { .. } => "AlreadyClaimed",
            Violation::MissingPrereqs(_) => "MissingPrerequisites",
            Violation::EvidenceRequired { .. } => "EvidenceRequired",
            Violation::AttemptNotOpen { .. } => "AttemptNotOpen",
            Violation::AttemptNotFound { .. } => "AttemptNotFound",
            Violation::WorkItemNotFound { .. } => "WorkItemNotFound",
            Violation::InvalidArtifactType { .. } => "InvalidArtifactType",
            Violation::InvalidRequest { .. } => "InvalidRequest",
            Violation::Seal(inner) => inner.code(),
            Violation::Permit(inner) => inner.code(),
            Violation::Completion(inner) => inner.code(),
        }
    }

    pub fn missing(unmet: Vec<Unmet>) -> Self {
        Violation::MissingPrereqs(MissingPrereqs { unmet })
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Violation::InvalidRequest {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Fatal for the operation, not for the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityViolation {
    #[error("{subject}: expected hash {expected}, found {actual}")]
    HashMismatch {
        subject: String,
        expected: Hash,
        actual: Hash,
    },
    #[error("duplicate key '{key}'")]
    DuplicateKey { key: String },
    #[error("input is not valid UTF-8 (valid up to byte {valid_up_to})")]
    InvalidEncoding { valid_up_to: usize },
    #[error("{record} is immutable and was already recorded with different content")]
    ImmutableRecord { record: String },
    #[error("dependency {work_id} -> {depends_on} would create a cycle")]
    DependencyCycle { work_id: WorkId, depends_on: WorkId },
}

impl IntegrityViolation {
    pub fn code(&self) -> &'static str {
        match self {
            IntegrityViolation::HashMismatch { .. } => "HASH_MISMATCH",
            IntegrityViolation::DuplicateKey { .. } => "DUPLICATE_KEY",
            IntegrityViolation::InvalidEncoding { .. } => "INVALID_ENCODING",
            IntegrityViolation::ImmutableRecord { .. } => "IMMUTABLE_RECORD",
            IntegrityViolation::DependencyCycle { .. } => "DEPENDENCY_CYCLE",
        }
    }

    pub fn immutable(record: impl Into<String>) -> Self {
        IntegrityViolation::ImmutableRecord {
            record: record.into(),
        }
    }
}

/// Error returned by every coordinator operation.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error(transparent)]
    Policy(#[from] Violation),
    #[error("integrity violation: {0}")]
    Integrity(#[from] IntegrityViolation),
    #[error("infrastructure fault: {0}")]
    Infrastructure(#[from] KernelError),
}

impl CoordError {
    /// Fixed reason code for the failure.
    pub fn code(&self) -> &'static str {
        match self {
            CoordError::Policy(violation) => violation.code(),
            CoordError::Integrity(violation) => violation.code(),
            CoordError::Infrastructure(_) => "INFRASTRUCTURE",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordError::Infrastructure(_))
    }

    pub fn violation(&self) -> Option<&Violation> {
        match self {
            CoordError::Policy(violation) => Some(violation),
            _ => None,
        }
    }

    pub fn missing_prereqs(&self) -> Option<&MissingPrereqs> {
        match self {
            CoordError::Policy(Violation::MissingPrereqs(missing)) => Some(missing),
            _ => None,
        }
    }
}

impl From<StoreError> for CoordError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::HashMismatch {
                kind,
                expected,
                actual,
            } => CoordError::Integrity(IntegrityViolation::HashMismatch {
                subject: format!("stored {kind:?}"),
                expected,
                actual,
            }),
            other => CoordError::Infrastructure(KernelError::Store(other)),
        }
    }
}

impl From<CanonError> for CoordError {
    fn from(err: CanonError) -> Self {
        match err {
            CanonError::DuplicateKey { key } => {
                CoordError::Integrity(IntegrityViolation::DuplicateKey { key })
            }
            CanonError::InvalidEncoding { valid_up_to } => {
                CoordError::Integrity(IntegrityViolation::InvalidEncoding { valid_up_to })
            }
            other => CoordError::Infrastructure(KernelError::Canon(other)),
        }
    }
}

impl From<BundleError> for CoordError {
    fn from(err: BundleError) -> Self {
        match err {
            BundleError::Canon(err) => err.into(),
            other => Violation::invalid("report", other.to_string()).into(),
        }
    }
}

impl From<JournalError> for CoordError {
    fn from(err: JournalError) -> Self {
        CoordError::Infrastructure(KernelError::Journal(err))
    }
}
