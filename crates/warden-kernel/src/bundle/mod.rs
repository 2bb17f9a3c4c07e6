//! Evidence bundles: the verifiable record of one governed run.
//!
//! A bundle is a [`RunManifest`] plus the artifact files it references (per-gate stdout/stderr
//! logs and any extra artifacts such as diffs). `run_hash` is the canonical hash of the manifest
//! with `run_hash` and `signature` removed; `prev_run_hash` chains runs within a workspace.

pub mod layout;
pub mod verify;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use warden_canon::{CanonError, Hash, canonicalize};

use crate::clock::Timestamp;
use crate::permit::UnpermittedAttempt;
use crate::reconcile::ReconReport;
use crate::seal::{PlanSeal, SealedPlan};
use crate::signing::{KeySignature, MANIFEST_DOMAIN, Signer};

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pass,
    Fail,
    Skipped,
    Error,
}

impl GateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateStatus::Pass => "pass",
            GateStatus::Fail => "fail",
            GateStatus::Skipped => "skipped",
            GateStatus::Error => "error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate_id: String,
    pub status: GateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default)]
    pub log_refs: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetCounters {
    pub tokens: u64,
    pub cost_micros: u64,
    pub tool_calls: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub created_at: Timestamp,
    pub workspace_id: String,
    pub policy_versions: BTreeMap<String, String>,
    pub plan_hash: Hash,
    pub plan: SealedPlan,
    pub source_snapshot: String,
    pub gates: Vec<GateResult>,
    pub changed_paths: Vec<String>,
    pub untracked_delta_paths: Vec<String>,
    /// Relative path inside the bundle to the artifact's hash.
    pub artifacts: BTreeMap<String, Hash>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unpermitted_attempts: Vec<UnpermittedAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetCounters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_run_hash: Option<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_hash: Option<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<KeySignature>,
}

impl RunManifest {
    /// Canonical hash of the manifest without `run_hash` and `signature`.
    pub fn compute_run_hash(&self) -> Result<Hash, CanonError> {
        let mut value =
            serde_json::to_value(self).map_err(|err| CanonError::Serialize(err.to_string()))?;
        if let Value::Object(map) = &mut value {
            map.remove("run_hash");
            map.remove("signature");
        }
        Ok(Hash::of_bytes(&canonicalize(&value)?))
    }

    pub fn gate(&self, gate_id: &str) -> Option<&GateResult> {
        self.gates.iter().find(|gate| gate.gate_id == gate_id)
    }

    /// A gate passed when it was reported and every result under its id is a pass.
    pub fn gate_passed(&self, gate_id: &str) -> bool {
        let mut results = self
            .gates
            .iter()
            .filter(|gate| gate.gate_id == gate_id)
            .peekable();
        results.peek().is_some() && results.all(|gate| gate.status == GateStatus::Pass)
    }
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("gate '{gate_id}' is reported more than once")]
    DuplicateGate { gate_id: String },
    #[error("bundle path '{path}' would be written twice")]
    PathCollision { path: String },
    #[error("artifact path '{path}' {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error(transparent)]
    Canon(#[from] CanonError),
}

/// One gate execution as reported by the external runner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRun {
    pub gate_id: String,
    pub status: GateStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default, with = "serde_bytes")]
    pub stdout: Vec<u8>,
    #[serde(default, with = "serde_bytes")]
    pub stderr: Vec<u8>,
}

/// Extra file carried in the bundle, such as a diff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedArtifact {
    pub path: String,
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}

/// Everything an executor reports once gates have run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunReport {
    pub run_id: Option<String>,
    pub source_snapshot: String,
    pub gates: Vec<GateRun>,
    pub changed_paths: Vec<String>,
    pub plan_hash: Option<Hash>,
    pub policy_versions: Option<BTreeMap<String, String>>,
    pub budget: Option<BudgetCounters>,
    pub artifacts: Vec<NamedArtifact>,
}

/// A finished manifest with the file contents it references.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bundle {
    pub manifest: RunManifest,
    pub files: BTreeMap<String, Vec<u8>>,
}

impl Bundle {
    pub fn run_hash(&self) -> Option<Hash> {
        self.manifest.run_hash
    }
}

/// Assembles a bundle. Conflicting inputs are held until [`BundleBuilder::finish`], which
/// refuses the bundle with the first one found.
pub struct BundleBuilder {
    manifest: RunManifest,
    files: BTreeMap<String, Vec<u8>>,
    conflict: Option<BundleError>,
}

impl BundleBuilder {
    pub fn new(
        run_id: impl Into<String>,
        workspace_id: impl Into<String>,
        created_at: Timestamp,
        seal: &PlanSeal,
        source_snapshot: impl Into<String>,
    ) -> Self {
        Self {
            manifest: RunManifest {
                schema_version: MANIFEST_SCHEMA_VERSION,
                run_id: run_id.into(),
                created_at,
                workspace_id: workspace_id.into(),
                policy_versions: seal.plan.policy_versions.clone(),
                plan_hash: seal.plan_hash,
                plan: seal.plan.clone(),
                source_snapshot: source_snapshot.into(),
                gates: Vec::new(),
                changed_paths: Vec::new(),
                untracked_delta_paths: Vec::new(),
                artifacts: BTreeMap::new(),
                unpermitted_attempts: Vec::new(),
                budget: None,
                prev_run_hash: None,
                run_hash: None,
                signature: None,
            },
            files: BTreeMap::new(),
            conflict: None,
        }
    }

    pub fn policy_versions(mut self, versions: BTreeMap<String, String>) -> Self {
        self.manifest.policy_versions = versions;
        self
    }

    pub fn gate(mut self, run: GateRun) -> Self {
        if self.manifest.gate(&run.gate_id).is_some() {
            self.reject(BundleError::DuplicateGate {
                gate_id: run.gate_id,
            });
            return self;
        }
        let stdout_path = layout::log_path(&run.gate_id, "stdout");
        let stderr_path = layout::log_path(&run.gate_id, "stderr");
        self.manifest.gates.push(GateResult {
            gate_id: run.gate_id,
            status: run.status,
            exit_code: run.exit_code,
            duration_ms: run.duration_ms,
            log_refs: vec![stdout_path.clone(), stderr_path.clone()],
        });
        self.insert_file(stdout_path, run.stdout);
        self.insert_file(stderr_path, run.stderr);
        self
    }

    pub fn artifact(mut self, path: impl Into<String>, bytes: Vec<u8>) -> Self {
        let path = path.into();
        match layout::check_artifact_path(&path) {
            Ok(()) => self.insert_file(path, bytes),
            Err(err) => self.reject(err),
        }
        self
    }

    pub fn changed_paths(mut self, paths: Vec<String>) -> Self {
        self.manifest.changed_paths = paths;
        self
    }

    pub fn reconciliation(mut self, report: &ReconReport) -> Self {
        self.manifest.untracked_delta_paths = report.untracked_delta_paths.clone();
        self
    }

    pub fn unpermitted(mut self, attempts: Vec<UnpermittedAttempt>) -> Self {
        self.manifest.unpermitted_attempts = attempts;
        self
    }

    pub fn budget(mut self, budget: Option<BudgetCounters>) -> Self {
        self.manifest.budget = budget;
        self
    }

    pub fn prev_run_hash(mut self, prev: Option<Hash>) -> Self {
        self.manifest.prev_run_hash = prev;
        self
    }

    /// Compute `run_hash` and sign it when a signer is supplied.
    pub fn finish(mut self, signer: Option<&Signer>) -> Result<Bundle, BundleError> {
        if let Some(conflict) = self.conflict {
            return Err(conflict);
        }
        let run_hash = self.manifest.compute_run_hash()?;
        self.manifest.run_hash = Some(run_hash);
        self.manifest.signature =
            signer.map(|signer| KeySignature::create(signer, MANIFEST_DOMAIN, &run_hash));
        Ok(Bundle {
            manifest: self.manifest,
            files: self.files,
        })
    }

    fn insert_file(&mut self, path: String, bytes: Vec<u8>) {
        if self.files.contains_key(&path) {
            self.reject(BundleError::PathCollision { path });
            return;
        }
        self.manifest
            .artifacts
            .insert(path.clone(), Hash::of_bytes(&bytes));
        self.files.insert(path, bytes);
    }

    fn reject(&mut self, err: BundleError) {
        if self.conflict.is_none() {
            self.conflict = Some(err);
        }
    }
}
