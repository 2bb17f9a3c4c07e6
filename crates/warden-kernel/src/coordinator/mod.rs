//! The coordination facade: the single write path into kernel state.
//!
//! Every mutation runs inside one exclusive transaction: guards are checked against the current
//! read model, the resulting [`JournalRecord`] is appended to the audit log, and only then folded
//! into [`KernelState`]. Reads take the shared lock and see a consistent snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use serde::{Deserialize, Serialize};
use warden_canon::{Hash, to_canonical_json};
use warden_store::{FsStore, MemStore, Store, StoreError};

use crate::bundle::layout::{StoreArtifacts, write_bundle};
use crate::bundle::verify::{VerifyPolicy, VerifyReport, verify_manifest};
use crate::bundle::{BundleBuilder, RunManifest, RunReport};
use crate::clock::{Clock, SystemClock, Timestamp};
use crate::completion::{
    BindingInput, CompletionClaim, CompletionReceipt, GateException, GateExceptionRequest,
    HeadSource, bind,
};
use crate::config::{ConfigError, KernelConfig};
use crate::contract::Contract;
use crate::error::{CoordError, CoordResult, IntegrityViolation, KernelError, Unmet, Violation};
use crate::ids::{AttemptId, BlockerId, DecisionId, EvidenceId, WorkId};
use crate::journal::fs::FsJournal;
use crate::journal::mem::MemJournal;
use crate::journal::{
    AttemptAbandonedRecord, AttemptBlockedRecord, AttemptClaimedRecord, AttemptCompletedRecord,
    AttemptHandedOffRecord, BlockerResolvedRecord, DependencyAddedRecord, Journal, JournalEntry,
    JournalRecord, JournalSeq, LeaseExpiredRecord, LeaseRenewedRecord, PermitConsumedRecord,
    RejectedRecord, RunFinalizedRecord, WorkItemChangeRecord, WorkItemCreatedRecord,
};
use crate::lease::{Attempt, ClaimCheck, Disposition};
use crate::ledger::{CreateCheck, Requirements, WorkItem, WorkStatus};
use crate::permit::{
    ActionRequest, AuthorizationContext, Permit, PermitBody, PermitRequest, UnpermittedAttempt,
};
use crate::query::{AuditEntry, ReadMeta, StateRead};
use crate::reconcile::reconcile;
use crate::records::{
    ArtifactKind, Blocker, BlockerResolution, Decision, EvidenceRecord, OutcomeRecord, Recorded,
    ResolutionBasis,
};
use crate::seal::{ExecutionSummary, PlanDraft, PlanSeal, SealedPlan, verify_execution};
use crate::signing::Signer;
use crate::state::{KernelState, RunEntry};

mod bootstrap;
mod facade;
mod planning;
mod query_api;
mod run_governance;

pub use bootstrap::CoordinatorBuilder;
pub use facade::{
    AttemptContext, ClaimGrant, EvidenceInput, OutcomeAccepted, OutcomeInput, ReleaseOutcome,
    ReleaseRequest,
};
pub use run_governance::FinalizedRun;

const MS_PER_MINUTE: u64 = 60_000;

pub struct Coordinator<S: Store> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    heads: Arc<dyn HeadSource>,
    config: KernelConfig,
    signer: Option<Signer>,
    inner: RwLock<Inner>,
}

struct Inner {
    journal: Box<dyn Journal>,
    state: KernelState,
}

/// Entities a refused write was aimed at, for the audit record.
#[derive(Debug, Clone, Default)]
pub(crate) struct Scope {
    attempt_id: Option<AttemptId>,
    work_id: Option<WorkId>,
}

impl Scope {
    fn attempt(attempt_id: AttemptId) -> Self {
        Self {
            attempt_id: Some(attempt_id),
            work_id: None,
        }
    }

    fn work(work_id: &WorkId) -> Self {
        Self {
            attempt_id: None,
            work_id: Some(work_id.clone()),
        }
    }
}

/// Exclusive access to state for the duration of one operation.
pub(crate) struct Txn<'a> {
    inner: &'a mut Inner,
    now: Timestamp,
}

impl Txn<'_> {
    fn state(&self) -> &KernelState {
        &self.inner.state
    }

    /// Append the record, then fold it into state.
    fn commit(&mut self, record: JournalRecord) -> CoordResult<JournalSeq> {
        let payload = to_canonical_json(&record)?;
        let seq = self
            .inner
            .journal
            .append(JournalEntry::new(record.kind(), &payload))?;
        self.inner.state.apply(&record);
        Ok(seq)
    }

    /// Lazily expire the attempt's lease if it has lapsed.
    fn sweep_attempt(&mut self, attempt_id: AttemptId) -> CoordResult<()> {
        let lapsed = self
            .state()
            .attempts
            .lapsed(attempt_id, self.now)
            .map(|attempt| (attempt.work_id.clone(), attempt.lease.expires_at));
        if let Some((work_id, expires_at)) = lapsed {
            self.expire(attempt_id, work_id, expires_at)?;
        }
        Ok(())
    }

    fn sweep_work(&mut self, work_id: &WorkId) -> CoordResult<()> {
        let lapsed = self
            .state()
            .attempts
            .lapsed_for_work(work_id, self.now)
            .map(|attempt| (attempt.id, attempt.lease.expires_at));
        if let Some((attempt_id, expires_at)) = lapsed {
            self.expire(attempt_id, work_id.clone(), expires_at)?;
        }
        Ok(())
    }

    fn expire(
        &mut self,
        attempt_id: AttemptId,
        work_id: WorkId,
        expires_at: Timestamp,
    ) -> CoordResult<()> {
        log::warn!("lease of {attempt_id} on {work_id} expired at {expires_at}; marking abandoned");
        self.commit(JournalRecord::LeaseExpired(LeaseExpiredRecord {
            attempt_id,
            work_id,
            expired_at: expires_at,
            observed_at: self.now,
        }))?;
        Ok(())
    }
}

impl<S: Store + 'static> Coordinator<S> {
    pub fn builder(store: Arc<S>) -> CoordinatorBuilder<S> {
        CoordinatorBuilder::new(store)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Public key of the kernel signing key, if one is configured.
    pub fn public_key_hex(&self) -> Option<String> {
        self.signer.as_ref().map(Signer::public_key_hex)
    }

    fn now(&self) -> Timestamp {
        self.clock.now_ms()
    }

    fn lease_expiry(&self, from: Timestamp) -> Timestamp {
        from.saturating_add(self.config.lease_ttl_ms())
    }

    fn verify_policy(&self) -> VerifyPolicy {
        VerifyPolicy {
            signature_required: self.config.signature_required,
            trusted_keys: self.public_key_hex().into_iter().collect(),
        }
    }

    fn read(&self) -> CoordResult<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| CoordError::Infrastructure(KernelError::LockPoisoned))
    }

    fn read_meta(&self, inner: &Inner) -> ReadMeta {
        ReadMeta {
            journal_height: inner.journal.next_seq(),
            workspace_id: self.config.workspace_id.clone(),
        }
    }

    /// Run `op` under the write lock. Refusals (policy and integrity) are journaled before they
    /// are returned; infrastructure faults are not.
    fn transact<T>(
        &self,
        op: &'static str,
        scope: Scope,
        f: impl FnOnce(&mut Txn<'_>) -> CoordResult<T>,
    ) -> CoordResult<T> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| CoordError::Infrastructure(KernelError::LockPoisoned))?;
        let mut txn = Txn {
            inner: &mut guard,
            now: self.now(),
        };
        match f(&mut txn) {
            Ok(value) => Ok(value),
            Err(err) => {
                // Permit denials are journaled as ActionDenied by the authorizer itself.
                let journaled = matches!(err, CoordError::Policy(Violation::Permit(_)));
                if !err.is_retryable() && !journaled {
                    log::warn!("{op} refused: {} ({err})", err.code());
                    let record = JournalRecord::Rejected(RejectedRecord {
                        operation: op.to_string(),
                        code: err.code().to_string(),
                        detail: err.to_string(),
                        attempt_id: scope.attempt_id,
                        work_id: scope.work_id,
                        rejected_at: txn.now,
                    });
                    if let Err(journal_err) = txn.commit(record) {
                        log::warn!("failed to journal refused {op}: {journal_err}");
                    }
                }
                Err(err)
            }
        }
    }

    fn load_contract(&self, hash: Hash) -> CoordResult<Contract> {
        Ok(self.store.get_node(hash)?)
    }
}

impl Coordinator<FsStore> {
    /// Open (or create) a coordinator rooted at `root`: store under `<root>/.warden/store`,
    /// journal under `<root>/.warden/journal`.
    pub fn open_dir(root: impl AsRef<Path>, config: KernelConfig) -> Result<Self, KernelError> {
        let root = root.as_ref();
        let store = Arc::new(FsStore::open(root)?);
        let journal = FsJournal::open(root)?;
        CoordinatorBuilder::new(store)
            .config(config)
            .journal(Box::new(journal))
            .open()
    }
}

impl Coordinator<MemStore> {
    pub fn in_memory(config: KernelConfig) -> Result<Self, KernelError> {
        CoordinatorBuilder::new(Arc::new(MemStore::new()))
            .config(config)
            .journal(Box::new(MemJournal::new()))
            .open()
    }
}
