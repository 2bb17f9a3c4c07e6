//! Local-first coordination kernel: work ledger, leased attempts, sealed plans, permits, evidence
//! bundles and evidence-bound completion, all behind one journaled write path.

pub mod bundle;
pub mod clock;
pub mod completion;
pub mod config;
pub mod contract;
pub mod coordinator;
pub mod error;
pub mod ids;
pub mod journal;
pub mod lease;
pub mod ledger;
pub mod permit;
pub mod query;
pub mod reconcile;
pub mod records;
pub mod seal;
pub mod signing;
pub mod state;

pub use bundle::verify::{
    ChainBreak, VerifyOutcome, VerifyPolicy, VerifyReport, verify_chain, verify_manifest,
};
pub use bundle::{BundleBuilder, GateRun, GateStatus, NamedArtifact, RunManifest, RunReport};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use completion::{
    CompletionClaim, CompletionFailure, CompletionReceipt, FixedHead, GateException,
    GateExceptionRequest, GitRefHead, HeadAttestation, HeadSource,
};
pub use config::{ConfigError, KernelConfig};
pub use contract::{Contract, Standard, StandardsCatalog};
pub use coordinator::{
    AttemptContext, ClaimGrant, Coordinator, CoordinatorBuilder, EvidenceInput, FinalizedRun,
    OutcomeAccepted, OutcomeInput, ReleaseOutcome, ReleaseRequest,
};
pub use error::{
    CoordError, CoordResult, IntegrityViolation, KernelError, MissingPrereqs, Unmet, Violation,
};
pub use ids::{AttemptId, BlockerId, DecisionId, EvidenceId, WorkId};
pub use lease::{Attempt, Disposition, Lease};
pub use ledger::{Requirements, WorkItem, WorkStatus};
pub use permit::{ActionKind, ActionRequest, Permit, PermitConstraints, PermitDenial, PermitRequest};
pub use query::{AuditEntry, ReadMeta, StateRead};
pub use records::{ArtifactKind, Blocker, Decision, EvidenceRecord, ResolutionBasis};
pub use seal::{GateTier, PlanDraft, PlanSeal, SealViolation};
pub use signing::{SealStrength, Signer};
