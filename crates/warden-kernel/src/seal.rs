//! Plan Seal authority.
//!
//! A draft plan (gate tier, required gates, scope patterns, policy versions) is frozen into a
//! [`SealedPlan`] whose canonical hash is the `plan_hash`. Permits and run manifests reference
//! that hash; execution that diverges from it is reported as a [`SealViolation`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_canon::{CanonError, Hash};

use crate::clock::Timestamp;
use crate::contract::Contract;
use crate::error::{CoordError, IntegrityViolation, KernelError, Violation};
use crate::ids::{AttemptId, WorkId};
use crate::reconcile::{ReconError, ScopeMatcher, reconcile_with};
use crate::records::Recorded;
use crate::signing::{KeySignature, SEAL_DOMAIN, SealStrength, Signer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateTier {
    Quick,
    Standard,
    Full,
}

/// Plan as proposed before sealing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDraft {
    pub tier: GateTier,
    pub required_gates: Vec<String>,
    pub scope: Vec<String>,
    #[serde(default)]
    pub policy_versions: BTreeMap<String, String>,
}

/// Immutable plan content covered by `plan_hash`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPlan {
    pub attempt_id: AttemptId,
    pub work_id: WorkId,
    pub contract_hash: Hash,
    pub tier: GateTier,
    pub required_gates: BTreeSet<String>,
    pub scope: BTreeSet<String>,
    pub policy_versions: BTreeMap<String, String>,
}

impl SealedPlan {
    /// Freeze a draft against the attempt's contract. Contract gates must all be present and
    /// contract policy versions cannot be overridden.
    pub fn from_draft(
        draft: &PlanDraft,
        attempt_id: AttemptId,
        work_id: &WorkId,
        contract_hash: Hash,
        contract: &Contract,
    ) -> Result<Self, CoordError> {
        let required_gates: BTreeSet<String> = draft
            .required_gates
            .iter()
            .map(|gate| gate.trim().to_string())
            .collect();
        if required_gates.iter().any(String::is_empty) {
            return Err(Violation::invalid("required_gates", "gate ids must not be empty").into());
        }
        let missing: BTreeSet<String> = contract
            .required_gates
            .difference(&required_gates)
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(Violation::Seal(SealViolation::MissingGates { gates: missing }).into());
        }

        ScopeMatcher::new(&draft.scope)
            .map_err(|err| Violation::invalid("scope", err.to_string()))?;

        let mut policy_versions = contract.policy_versions.clone();
        let mut drift = Vec::new();
        for (key, version) in &draft.policy_versions {
            match policy_versions.get(key) {
                Some(existing) if existing != version => drift.push(key.clone()),
                Some(_) => {}
                None => {
                    policy_versions.insert(key.clone(), version.clone());
                }
            }
        }
        if !drift.is_empty() {
            return Err(Violation::Seal(SealViolation::PolicyDrift { keys: drift }).into());
        }

        Ok(SealedPlan {
            attempt_id,
            work_id: work_id.clone(),
            contract_hash,
            tier: draft.tier,
            required_gates,
            scope: draft.scope.iter().map(|p| p.trim().to_string()).collect(),
            policy_versions,
        })
    }

    pub fn plan_hash(&self) -> Result<Hash, CanonError> {
        Hash::of_json(self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSeal {
    pub plan_hash: Hash,
    pub plan: SealedPlan,
    pub sealed_at: Timestamp,
    pub strength: SealStrength,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<KeySignature>,
}

impl PlanSeal {
    pub fn seal(
        plan: SealedPlan,
        sealed_at: Timestamp,
        strength: SealStrength,
        signer: Option<&Signer>,
    ) -> Result<Self, KernelError> {
        let plan_hash = plan.plan_hash()?;
        let signature = match (strength.requires_signature(), signer) {
            (true, Some(signer)) => Some(KeySignature::create(signer, SEAL_DOMAIN, &plan_hash)),
            (true, None) => {
                return Err(KernelError::Signing(
                    "signed seal strength configured without a signing key".into(),
                ));
            }
            (false, _) => None,
        };
        Ok(PlanSeal {
            plan_hash,
            plan,
            sealed_at,
            strength,
            signature,
        })
    }

    /// Re-derive the plan hash (and check the signature when signed) before trusting the seal.
    pub fn verify_integrity(
        &self,
        strength: SealStrength,
        trusted_key: Option<&str>,
    ) -> Result<(), SealViolation> {
        if strength.checks_hash() {
            let found = self.plan.plan_hash().map_err(|_| SealViolation::PlanMismatch {
                expected: self.plan_hash,
                found: Hash::ZERO,
            })?;
            if found != self.plan_hash {
                return Err(SealViolation::PlanMismatch {
                    expected: self.plan_hash,
                    found,
                });
            }
        }
        if strength.requires_signature() {
            let valid = match (&self.signature, trusted_key) {
                (Some(sig), Some(key)) => {
                    sig.public_key == key && sig.verify(SEAL_DOMAIN, &self.plan_hash)
                }
                _ => false,
            };
            if !valid {
                return Err(SealViolation::PlanMismatch {
                    expected: self.plan_hash,
                    found: self.plan_hash,
                });
            }
        }
        Ok(())
    }
}

fn braces(items: &BTreeSet<String>) -> String {
    let joined: Vec<&str> = items.iter().map(String::as_str).collect();
    format!("{{{}}}", joined.join(", "))
}

/// Divergence between a sealed plan and what actually ran.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code")]
pub enum SealViolation {
    #[serde(rename = "SEAL.PLAN_MISMATCH")]
    #[error("executed plan {found} does not match sealed plan {expected}")]
    PlanMismatch { expected: Hash, found: Hash },
    #[serde(rename = "SEAL.MISSING_GATES")]
    #[error("{}", braces(.gates))]
    MissingGates { gates: BTreeSet<String> },
    #[serde(rename = "SEAL.SCOPE_VIOLATION")]
    #[error("paths outside sealed scope: {}", .paths.join(", "))]
    ScopeViolation { paths: Vec<String> },
    #[serde(rename = "SEAL.POLICY_DRIFT")]
    #[error("policy versions changed since sealing: {}", .keys.join(", "))]
    PolicyDrift { keys: Vec<String> },
}

impl SealViolation {
    pub fn code(&self) -> &'static str {
        match self {
            SealViolation::PlanMismatch { .. } => "SEAL.PLAN_MISMATCH",
            SealViolation::MissingGates { .. } => "SEAL.MISSING_GATES",
            SealViolation::ScopeViolation { .. } => "SEAL.SCOPE_VIOLATION",
            SealViolation::PolicyDrift { .. } => "SEAL.POLICY_DRIFT",
        }
    }

    /// Scope violations are settled by reconciliation; everything else stops finalization.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SealViolation::ScopeViolation { .. })
    }
}

/// What an executor reports about a run, compared against the seal.
#[derive(Debug, Clone)]
pub struct ExecutionSummary<'a> {
    /// Plan hash the executor believes it ran, if it reports one.
    pub plan_hash: Option<Hash>,
    pub executed_gates: BTreeSet<&'a str>,
    pub changed_paths: &'a [String],
    pub policy_versions: Option<&'a BTreeMap<String, String>>,
}

/// Every divergence, in fixed order: plan, gates, scope, policy.
pub fn verify_execution(
    seal: &PlanSeal,
    execution: &ExecutionSummary<'_>,
) -> Result<Vec<SealViolation>, ReconError> {
    let mut violations = Vec::new();
    if let Some(found) = execution.plan_hash {
        if found != seal.plan_hash {
            violations.push(SealViolation::PlanMismatch {
                expected: seal.plan_hash,
                found,
            });
        }
    }
    let missing: BTreeSet<String> = seal
        .plan
        .required_gates
        .iter()
        .filter(|gate| !execution.executed_gates.contains(gate.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        violations.push(SealViolation::MissingGates { gates: missing });
    }
    let scope: Vec<&String> = seal.plan.scope.iter().collect();
    let report = reconcile_with(&ScopeMatcher::new(&scope)?, execution.changed_paths);
    if !report.passed {
        violations.push(SealViolation::ScopeViolation {
            paths: report.untracked_delta_paths,
        });
    }
    if let Some(current) = execution.policy_versions {
        let keys: BTreeSet<&String> = seal
            .plan
            .policy_versions
            .keys()
            .chain(current.keys())
            .collect();
        let drift: Vec<String> = keys
            .into_iter()
            .filter(|key| seal.plan.policy_versions.get(*key) != current.get(*key))
            .cloned()
            .collect();
        if !drift.is_empty() {
            violations.push(SealViolation::PolicyDrift { keys: drift });
        }
    }
    Ok(violations)
}

/// Seals by plan hash, plus the seal currently governing each attempt.
#[derive(Debug, Clone, Default)]
pub struct SealRegistry {
    seals: HashMap<Hash, PlanSeal>,
    active: HashMap<AttemptId, Hash>,
}

impl SealRegistry {
    pub fn get(&self, plan_hash: &Hash) -> Option<&PlanSeal> {
        self.seals.get(plan_hash)
    }

    pub fn active_for(&self, attempt_id: AttemptId) -> Option<&PlanSeal> {
        self.active
            .get(&attempt_id)
            .and_then(|hash| self.seals.get(hash))
    }

    /// At most one unfinalized seal per attempt. Resealing the identical plan is a no-op.
    pub(crate) fn check_seal(
        &self,
        attempt_id: AttemptId,
        plan_hash: &Hash,
    ) -> Result<Recorded<Hash>, CoordError> {
        match self.active.get(&attempt_id) {
            None => Ok(Recorded::New),
            Some(active) if active == plan_hash => Ok(Recorded::Existing(*active)),
            Some(_) => Err(IntegrityViolation::immutable(format!(
                "active plan seal of {attempt_id}"
            ))
            .into()),
        }
    }

    pub(crate) fn apply_sealed(&mut self, seal: &PlanSeal) {
        self.active.insert(seal.plan.attempt_id, seal.plan_hash);
        self.seals
            .entry(seal.plan_hash)
            .or_insert_with(|| seal.clone());
    }

    /// A finalized run spends its seal; the next run needs a new one.
    pub(crate) fn apply_finalized(&mut self, attempt_id: AttemptId, plan_hash: &Hash) {
        if self.active.get(&attempt_id) == Some(plan_hash) {
            self.active.remove(&attempt_id);
        }
    }
}
