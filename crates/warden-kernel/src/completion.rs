//! Completion Binder: the terminal gate for `release_work(done)`.
//!
//! A receipt is issued only when, in order:
//! 1. the referenced bundle exists and its `run_hash` matches the recomputed hash,
//! 2. the bundle verifier returns `PASS`,
//! 3. `untracked_delta_paths` is empty,
//! 4. every required gate passed or is covered by an unexpired exception,
//! 5. the claimed source snapshot equals the bundle's snapshot,
//! 6. that snapshot is the current head of the target ref, or a trusted attester vouches for it.
//!
//! The first unmet condition wins.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use warden_canon::{CanonError, Hash};

use crate::bundle::layout::ArtifactSource;
use crate::bundle::verify::{VerifyOutcome, VerifyPolicy, verify_manifest};
use crate::bundle::RunManifest;
use crate::clock::Timestamp;
use crate::error::KernelError;
use crate::ids::{AttemptId, WorkId};
use crate::signing::{HEAD_DOMAIN, KeySignature, Signer};

pub const RECEIPT_SCHEMA_VERSION: u32 = 1;

/// Supplies the current head of a ref.
pub trait HeadSource: Send + Sync {
    fn head(&self, target_ref: &str) -> Result<Option<String>, KernelError>;
}

/// In-memory heads, set by the embedder.
#[derive(Debug, Default)]
pub struct FixedHead {
    heads: RwLock<BTreeMap<String, String>>,
}

impl FixedHead {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(target_ref: impl Into<String>, snapshot: impl Into<String>) -> Self {
        Self {
            heads: RwLock::new(BTreeMap::from([(target_ref.into(), snapshot.into())])),
        }
    }

    pub fn set(
        &self,
        target_ref: impl Into<String>,
        snapshot: impl Into<String>,
    ) -> Result<(), KernelError> {
        let mut heads = self.heads.write().map_err(|_| KernelError::LockPoisoned)?;
        heads.insert(target_ref.into(), snapshot.into());
        Ok(())
    }
}

impl HeadSource for FixedHead {
    fn head(&self, target_ref: &str) -> Result<Option<String>, KernelError> {
        let heads = self.heads.read().map_err(|_| KernelError::LockPoisoned)?;
        Ok(heads.get(target_ref).cloned())
    }
}

/// Reads refs straight out of a git directory: loose refs first, then `packed-refs`.
#[derive(Debug, Clone)]
pub struct GitRefHead {
    git_dir: PathBuf,
}

const MAX_SYMREF_DEPTH: usize = 5;

impl GitRefHead {
    pub fn new(git_dir: impl Into<PathBuf>) -> Self {
        Self {
            git_dir: git_dir.into(),
        }
    }

    fn resolve(&self, target_ref: &str, depth: usize) -> Result<Option<String>, KernelError> {
        if depth > MAX_SYMREF_DEPTH {
            return Err(KernelError::Head(format!(
                "symbolic ref chain too deep at {target_ref}"
            )));
        }
        if target_ref.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(KernelError::Head(format!("invalid ref name '{target_ref}'")));
        }
        let loose = self.git_dir.join(target_ref);
        match fs::read_to_string(&loose) {
            Ok(content) => {
                let trimmed = content.trim();
                if let Some(next) = trimmed.strip_prefix("ref:") {
                    return self.resolve(next.trim(), depth + 1);
                }
                if trimmed.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(trimmed.to_string()));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(KernelError::Io {
                    path: loose,
                    source: err,
                });
            }
        }
        self.packed(target_ref)
    }

    fn packed(&self, target_ref: &str) -> Result<Option<String>, KernelError> {
        let path = self.git_dir.join("packed-refs");
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(KernelError::Io { path, source }),
        };
        for line in content.lines() {
            if line.starts_with('#') || line.starts_with('^') {
                continue;
            }
            if let Some((sha, name)) = line.split_once(' ') {
                if name.trim() == target_ref {
                    return Ok(Some(sha.trim().to_string()));
                }
            }
        }
        Ok(None)
    }
}

impl HeadSource for GitRefHead {
    fn head(&self, target_ref: &str) -> Result<Option<String>, KernelError> {
        self.resolve(target_ref, 0)
    }
}

/// A trusted party's statement that `snapshot` is the head of `target_ref`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadAttestation {
    pub target_ref: String,
    pub snapshot: String,
    pub signature: KeySignature,
}

impl HeadAttestation {
    pub fn subject(target_ref: &str, snapshot: &str) -> Result<Hash, CanonError> {
        Hash::of_json(&json!({ "target_ref": target_ref, "snapshot": snapshot }))
    }

    pub fn sign(
        signer: &Signer,
        target_ref: impl Into<String>,
        snapshot: impl Into<String>,
    ) -> Result<Self, CanonError> {
        let target_ref = target_ref.into();
        let snapshot = snapshot.into();
        let subject = Self::subject(&target_ref, &snapshot)?;
        Ok(Self {
            signature: KeySignature::create(signer, HEAD_DOMAIN, &subject),
            target_ref,
            snapshot,
        })
    }

    /// Valid when it names this ref and snapshot and a trusted key signed it.
    pub fn vouches_for(&self, target_ref: &str, snapshot: &str, trusted: &[String]) -> bool {
        if self.target_ref != target_ref || self.snapshot != snapshot {
            return false;
        }
        if !trusted.contains(&self.signature.public_key) {
            return false;
        }
        Self::subject(target_ref, snapshot)
            .map(|subject| self.signature.verify(HEAD_DOMAIN, &subject))
            .unwrap_or(false)
    }
}

/// Explicit, time-bounded permission for one attempt to complete without a passing gate. Only
/// the coordinator grants these, and every grant is journaled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateException {
    pub attempt_id: AttemptId,
    pub gate_id: String,
    pub reason: String,
    pub granted_by: String,
    pub granted_at: Timestamp,
    pub expires_at: Timestamp,
}

impl GateException {
    pub fn covers(&self, gate_id: &str, now: Timestamp) -> bool {
        self.gate_id == gate_id
            && now < self.expires_at
            && !self.reason.trim().is_empty()
            && !self.granted_by.trim().is_empty()
    }
}

/// Ask for a [`GateException`] on an open attempt. `granted_by` must not be the claimant.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateExceptionRequest {
    pub gate_id: String,
    pub reason: String,
    pub granted_by: String,
    pub ttl_minutes: u32,
}

/// What the caller asserts when declaring an attempt done.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionClaim {
    /// Bundle to bind. Defaults to the attempt's latest run.
    pub run_hash: Option<Hash>,
    pub source_snapshot: String,
    pub attestation: Option<HeadAttestation>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReceipt {
    pub schema_version: u32,
    pub attempt_id: AttemptId,
    pub work_id: WorkId,
    pub run_hash: Hash,
    pub source_snapshot: String,
    pub target_ref: String,
    pub satisfied_gates: BTreeSet<String>,
    pub excepted_gates: BTreeSet<String>,
    pub head_attested: bool,
    pub completed_at: Timestamp,
}

impl CompletionReceipt {
    pub fn hash(&self) -> Result<Hash, CanonError> {
        Hash::of_json(self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code")]
pub enum CompletionFailure {
    #[serde(rename = "COMPLETE.EVIDENCE_MISSING")]
    #[error("no evidence bundle: {detail}")]
    EvidenceMissing { detail: String },
    #[serde(rename = "COMPLETE.EVIDENCE_HASH_MISMATCH")]
    #[error("bundle hash {expected} does not match recomputed {actual}")]
    EvidenceHashMismatch { expected: Hash, actual: Hash },
    #[serde(rename = "COMPLETE.VERIFY_FAILED")]
    #[error("bundle verification returned {outcome}")]
    VerifyFailed { outcome: VerifyOutcome },
    #[serde(rename = "COMPLETE.RECON_UNTRACKED_DELTA")]
    #[error("untracked changes: {}", .paths.join(", "))]
    ReconUntrackedDelta { paths: Vec<String> },
    #[serde(rename = "COMPLETE.GATE_FAILED")]
    #[error("required gates not passed: {}", .gates.iter().cloned().collect::<Vec<_>>().join(", "))]
    GateFailed { gates: BTreeSet<String> },
    #[serde(rename = "COMPLETE.SOURCE_STATE_MISMATCH")]
    #[error("claimed snapshot {claimed} but bundle was built from {bundle}")]
    SourceStateMismatch { claimed: String, bundle: String },
    #[serde(rename = "COMPLETE.SOURCE_NOT_HEAD")]
    #[error("snapshot {snapshot} is not the head of the target ref (head: {head:?})")]
    SourceNotHead {
        snapshot: String,
        head: Option<String>,
    },
}

impl CompletionFailure {
    pub fn code(&self) -> &'static str {
        match self {
            CompletionFailure::EvidenceMissing { .. } => "COMPLETE.EVIDENCE_MISSING",
            CompletionFailure::EvidenceHashMismatch { .. } => "COMPLETE.EVIDENCE_HASH_MISMATCH",
            CompletionFailure::VerifyFailed { .. } => "COMPLETE.VERIFY_FAILED",
            CompletionFailure::ReconUntrackedDelta { .. } => "COMPLETE.RECON_UNTRACKED_DELTA",
            CompletionFailure::GateFailed { .. } => "COMPLETE.GATE_FAILED",
            CompletionFailure::SourceStateMismatch { .. } => "COMPLETE.SOURCE_STATE_MISMATCH",
            CompletionFailure::SourceNotHead { .. } => "COMPLETE.SOURCE_NOT_HEAD",
        }
    }
}

/// Everything the binder looks at for one completion.
pub struct BindingInput<'a> {
    pub attempt_id: AttemptId,
    pub work_id: &'a WorkId,
    pub claim: &'a CompletionClaim,
    /// Exceptions granted to this attempt.
    pub exceptions: &'a [GateException],
    /// The bundle the claim resolves to, if it could be found.
    pub manifest: Option<&'a RunManifest>,
    pub artifacts: &'a dyn ArtifactSource,
    pub verify_policy: &'a VerifyPolicy,
    /// Gates required beyond the ones the sealed plan names.
    pub contract_gates: &'a BTreeSet<String>,
    pub target_ref: &'a str,
    pub head: Option<String>,
    pub trusted_attesters: &'a [String],
    pub now: Timestamp,
}

pub fn bind(input: &BindingInput<'_>) -> Result<CompletionReceipt, CompletionFailure> {
    let manifest = input
        .manifest
        .ok_or_else(|| CompletionFailure::EvidenceMissing {
            detail: match input.claim.run_hash {
                Some(hash) => format!("run {hash} is not recorded for {}", input.attempt_id),
                None => format!("{} has no finalized run", input.attempt_id),
            },
        })?;

    // 1. hash binding
    let actual = manifest
        .compute_run_hash()
        .map_err(|err| CompletionFailure::EvidenceMissing {
            detail: format!("manifest cannot be hashed: {err}"),
        })?;
    let expected = input.claim.run_hash.or(manifest.run_hash).unwrap_or(Hash::ZERO);
    if expected != actual || manifest.run_hash != Some(actual) {
        return Err(CompletionFailure::EvidenceHashMismatch { expected, actual });
    }

    // 2 + 3. verifier outcome and reconciliation
    let report = verify_manifest(manifest, input.artifacts, input.verify_policy);
    match report.outcome {
        VerifyOutcome::Pass => {}
        VerifyOutcome::UntrackedDelta => {
            return Err(CompletionFailure::ReconUntrackedDelta {
                paths: manifest.untracked_delta_paths.clone(),
            });
        }
        outcome => return Err(CompletionFailure::VerifyFailed { outcome }),
    }
    if !manifest.untracked_delta_paths.is_empty() {
        return Err(CompletionFailure::ReconUntrackedDelta {
            paths: manifest.untracked_delta_paths.clone(),
        });
    }

    // 4. gates
    let required: BTreeSet<&String> = manifest
        .plan
        .required_gates
        .iter()
        .chain(input.contract_gates.iter())
        .collect();
    let mut satisfied = BTreeSet::new();
    let mut excepted = BTreeSet::new();
    let mut failed = BTreeSet::new();
    for gate_id in required {
        if manifest.gate_passed(gate_id) {
            satisfied.insert(gate_id.clone());
        } else if input
            .exceptions
            .iter()
            .any(|exception| exception.covers(gate_id, input.now))
        {
            excepted.insert(gate_id.clone());
        } else {
            failed.insert(gate_id.clone());
        }
    }
    if !failed.is_empty() {
        return Err(CompletionFailure::GateFailed { gates: failed });
    }

    // 5. source snapshot
    if input.claim.source_snapshot != manifest.source_snapshot {
        return Err(CompletionFailure::SourceStateMismatch {
            claimed: input.claim.source_snapshot.clone(),
            bundle: manifest.source_snapshot.clone(),
        });
    }

    // 6. head
    let snapshot = &manifest.source_snapshot;
    let head_attested = input.claim.attestation.as_ref().is_some_and(|attestation| {
        attestation.vouches_for(input.target_ref, snapshot, input.trusted_attesters)
    });
    if !head_attested && input.head.as_deref() != Some(snapshot.as_str()) {
        return Err(CompletionFailure::SourceNotHead {
            snapshot: snapshot.clone(),
            head: input.head.clone(),
        });
    }

    Ok(CompletionReceipt {
        schema_version: RECEIPT_SCHEMA_VERSION,
        attempt_id: input.attempt_id,
        work_id: input.work_id.clone(),
        run_hash: actual,
        source_snapshot: snapshot.clone(),
        target_ref: input.target_ref.to_string(),
        satisfied_gates: satisfied,
        excepted_gates: excepted,
        head_attested,
        completed_at: input.now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::tests::{test_bundle, test_seal};
    use crate::bundle::{Bundle, BundleBuilder, GateRun, GateStatus};
    use tempfile::TempDir;

    const MAIN: &str = "refs/heads/main";

    fn claim(bundle: &Bundle) -> CompletionClaim {
        CompletionClaim {
            run_hash: bundle.run_hash(),
            source_snapshot: "abc123".into(),
            ..CompletionClaim::default()
        }
    }

    fn input<'a>(
        bundle: &'a Bundle,
        claim: &'a CompletionClaim,
        policy: &'a VerifyPolicy,
        gates: &'a BTreeSet<String>,
        work_id: &'a WorkId,
    ) -> BindingInput<'a> {
        BindingInput {
            attempt_id: AttemptId(1),
            work_id,
            claim,
            exceptions: &[],
            manifest: Some(&bundle.manifest),
            artifacts: &bundle.files,
            verify_policy: policy,
            contract_gates: gates,
            target_ref: MAIN,
            head: Some("abc123".into()),
            trusted_attesters: &[],
            now: 100,
        }
    }

    #[test]
    fn passing_bundle_at_head_binds() {
        let bundle = test_bundle(None);
        let claim = claim(&bundle);
        let policy = VerifyPolicy::default();
        let gates = BTreeSet::new();
        let work_id = WorkId::from("W1");
        let receipt = bind(&input(&bundle, &claim, &policy, &gates, &work_id)).unwrap();
        assert_eq!(receipt.run_hash, bundle.run_hash().unwrap());
        assert_eq!(receipt.satisfied_gates, BTreeSet::from(["unit".to_string()]));
        assert!(receipt.excepted_gates.is_empty());
        assert!(!receipt.head_attested);
        assert_eq!(receipt.completed_at, 100);
    }

    #[test]
    fn missing_bundle_is_evidence_missing() {
        let bundle = test_bundle(None);
        let claim = claim(&bundle);
        let policy = VerifyPolicy::default();
        let gates = BTreeSet::new();
        let work_id = WorkId::from("W1");
        let mut binding = input(&bundle, &claim, &policy, &gates, &work_id);
        binding.manifest = None;
        assert_eq!(bind(&binding).unwrap_err().code(), "COMPLETE.EVIDENCE_MISSING");
    }

    #[test]
    fn claimed_hash_must_match() {
        let bundle = test_bundle(None);
        let mut claim = claim(&bundle);
        claim.run_hash = Some(Hash::of_bytes(b"other"));
        let policy = VerifyPolicy::default();
        let gates = BTreeSet::new();
        let work_id = WorkId::from("W1");
        let err = bind(&input(&bundle, &claim, &policy, &gates, &work_id)).unwrap_err();
        assert_eq!(err.code(), "COMPLETE.EVIDENCE_HASH_MISMATCH");
    }

    #[test]
    fn tampered_log_fails_verification() {
        let mut bundle = test_bundle(None);
        bundle
            .files
            .insert("logs/unit.stdout.log".into(), b"0 passed".to_vec());
        let claim = claim(&bundle);
        let policy = VerifyPolicy::default();
        let gates = BTreeSet::new();
        let work_id = WorkId::from("W1");
        let err = bind(&input(&bundle, &claim, &policy, &gates, &work_id)).unwrap_err();
        assert_eq!(
            err,
            CompletionFailure::VerifyFailed {
                outcome: VerifyOutcome::ArtifactMismatch
            }
        );
    }

    #[test]
    fn untracked_delta_blocks_completion() {
        let report = crate::reconcile::reconcile(&["src/**"], &["README.md"]).unwrap();
        let bundle = BundleBuilder::new("run-1", "local", 5, &test_seal(), "abc123")
            .reconciliation(&report)
            .finish(None)
            .unwrap();
        let claim = claim(&bundle);
        let policy = VerifyPolicy::default();
        let gates = BTreeSet::new();
        let work_id = WorkId::from("W1");
        let err = bind(&input(&bundle, &claim, &policy, &gates, &work_id)).unwrap_err();
        assert_eq!(
            err,
            CompletionFailure::ReconUntrackedDelta {
                paths: vec!["README.md".into()]
            }
        );
    }

    #[test]
    fn failed_gate_needs_a_live_exception() {
        let bundle = BundleBuilder::new("run-1", "local", 5, &test_seal(), "abc123")
            .gate(GateRun {
                gate_id: "unit".into(),
                status: GateStatus::Fail,
                exit_code: Some(1),
                duration_ms: 10,
                stdout: Vec::new(),
                stderr: b"1 failed".to_vec(),
            })
            .finish(None)
            .unwrap();
        let claim = claim(&bundle);
        let policy = VerifyPolicy::default();
        let gates = BTreeSet::from(["lint".to_string()]);
        let work_id = WorkId::from("W1");
        let err = bind(&input(&bundle, &claim, &policy, &gates, &work_id)).unwrap_err();
        assert_eq!(
            err,
            CompletionFailure::GateFailed {
                gates: BTreeSet::from(["lint".to_string(), "unit".to_string()])
            }
        );

        let exception = |gate_id: &str, expires_at| GateException {
            attempt_id: AttemptId(1),
            gate_id: gate_id.into(),
            reason: "flaky upstream".into(),
            granted_by: "lead".into(),
            granted_at: 0,
            expires_at,
        };
        let mut exceptions = vec![exception("unit", 50), exception("lint", 500)];
        let mut binding = input(&bundle, &claim, &policy, &gates, &work_id);
        binding.exceptions = exceptions.as_slice();
        assert_eq!(
            bind(&binding).unwrap_err(),
            CompletionFailure::GateFailed {
                gates: BTreeSet::from(["unit".to_string()])
            }
        );

        exceptions[0].expires_at = 500;
        let mut binding = input(&bundle, &claim, &policy, &gates, &work_id);
        binding.exceptions = exceptions.as_slice();
        let receipt = bind(&binding).unwrap();
        assert_eq!(
            receipt.excepted_gates,
            BTreeSet::from(["lint".to_string(), "unit".to_string()])
        );
    }

    #[test]
    fn snapshot_must_match_bundle_then_head() {
        let bundle = test_bundle(None);
        let mut claim = claim(&bundle);
        claim.source_snapshot = "def456".into();
        let policy = VerifyPolicy::default();
        let gates = BTreeSet::new();
        let work_id = WorkId::from("W1");
        let err = bind(&input(&bundle, &claim, &policy, &gates, &work_id)).unwrap_err();
        assert_eq!(err.code(), "COMPLETE.SOURCE_STATE_MISMATCH");

        claim.source_snapshot = "abc123".into();
        let mut binding = input(&bundle, &claim, &policy, &gates, &work_id);
        binding.head = Some("fff000".into());
        assert_eq!(
            bind(&binding).unwrap_err(),
            CompletionFailure::SourceNotHead {
                snapshot: "abc123".into(),
                head: Some("fff000".into())
            }
        );
    }

    #[test]
    fn trusted_attestation_substitutes_for_head() {
        let attester = Signer::from_seed([3u8; 32]);
        let bundle = test_bundle(None);
        let mut claim = claim(&bundle);
        claim.attestation = Some(HeadAttestation::sign(&attester, MAIN, "abc123").unwrap());
        let policy = VerifyPolicy::default();
        let gates = BTreeSet::new();
        let work_id = WorkId::from("W1");
        let trusted = vec![attester.public_key_hex()];

        let mut binding = input(&bundle, &claim, &policy, &gates, &work_id);
        binding.head = None;
        assert_eq!(bind(&binding).unwrap_err().code(), "COMPLETE.SOURCE_NOT_HEAD");

        binding.trusted_attesters = trusted.as_slice();
        let receipt = bind(&binding).unwrap();
        assert!(receipt.head_attested);
    }

    #[test]
    fn fixed_head_starts_with_the_given_ref_and_can_move() {
        let heads = FixedHead::with(MAIN, "abc123");
        assert_eq!(heads.head(MAIN).unwrap().as_deref(), Some("abc123"));
        assert_eq!(heads.head("refs/heads/other").unwrap(), None);

        heads.set(MAIN, "def456").unwrap();
        assert_eq!(heads.head(MAIN).unwrap().as_deref(), Some("def456"));
    }

    #[test]
    fn git_refs_resolve_loose_symbolic_and_packed() {
        let tmp = TempDir::new().unwrap();
        let git = tmp.path();
        fs::create_dir_all(git.join("refs/heads")).unwrap();
        fs::write(git.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        fs::write(git.join("refs/heads/main"), "abc123\n").unwrap();
        fs::write(
            git.join("packed-refs"),
            "# pack-refs with: peeled fully-peeled sorted\n\
             def456 refs/heads/release\n\
             ^0000000000000000000000000000000000000000\n",
        )
        .unwrap();

        let heads = GitRefHead::new(git);
        assert_eq!(heads.head(MAIN).unwrap().as_deref(), Some("abc123"));
        assert_eq!(heads.head("HEAD").unwrap().as_deref(), Some("abc123"));
        assert_eq!(
            heads.head("refs/heads/release").unwrap().as_deref(),
            Some("def456")
        );
        assert_eq!(heads.head("refs/heads/nope").unwrap(), None);
        assert!(heads.head("refs/../../etc").is_err());
    }

    #[test]
    fn failure_codes_serialize_in_tag() {
        let failure = CompletionFailure::SourceNotHead {
            snapshot: "a".into(),
            head: None,
        };
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["code"], "COMPLETE.SOURCE_NOT_HEAD");
    }
}
