//! Append-only records attached to attempts: evidence, decisions, outcomes, blockers and gate
//! exceptions.
//!
//! None of these have an update path. Re-submitting identical content is idempotent; submitting
//! different content under the same identity is an integrity violation.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use warden_canon::Hash;

use crate::clock::Timestamp;
use crate::completion::{GateException, GateExceptionRequest};
use crate::error::{CoordError, IntegrityViolation, Unmet, Violation};
use crate::ids::{AttemptId, BlockerId, DecisionId, EvidenceId, WorkId};

/// Closed set of evidence artifact types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    TestResult,
    Diff,
    Log,
    GateResult,
    Review,
    Attestation,
    /// Run manifest produced by finalizing a governed run.
    Bundle,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::TestResult => "test_result",
            ArtifactKind::Diff => "diff",
            ArtifactKind::Log => "log",
            ArtifactKind::GateResult => "gate_result",
            ArtifactKind::Review => "review",
            ArtifactKind::Attestation => "attestation",
            ArtifactKind::Bundle => "bundle",
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = Violation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "test_result" | "test" => Ok(ArtifactKind::TestResult),
            "diff" | "patch" => Ok(ArtifactKind::Diff),
            "log" => Ok(ArtifactKind::Log),
            "gate_result" => Ok(ArtifactKind::GateResult),
            "review" => Ok(ArtifactKind::Review),
            "attestation" => Ok(ArtifactKind::Attestation),
            "bundle" => Ok(ArtifactKind::Bundle),
            _ => Err(Violation::InvalidArtifactType {
                kind: s.to_string(),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub id: EvidenceId,
    pub attempt_id: AttemptId,
    pub name: String,
    pub kind: ArtifactKind,
    pub hash: Hash,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub recorded_at: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub id: DecisionId,
    pub attempt_id: AttemptId,
    pub text: String,
    pub rationale: String,
    pub recorded_at: Timestamp,
}

/// Reference to an outcome payload stored as a node. Outcomes are progress reports, not proof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub attempt_id: AttemptId,
    pub outcome_hash: Hash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub recorded_at: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocker {
    pub id: BlockerId,
    pub attempt_id: AttemptId,
    pub work_id: WorkId,
    pub reason: String,
    pub raised_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<BlockerResolution>,
}

impl Blocker {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolutionBasis {
    Evidence { evidence_id: EvidenceId },
    Justification { text: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockerResolution {
    pub basis: ResolutionBasis,
    pub resolved_at: Timestamp,
}

/// Result of checking a write against already-recorded content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recorded<T> {
    New,
    Existing(T),
}

#[derive(Debug, Clone, Default)]
pub struct RecordBook {
    evidence: BTreeMap<EvidenceId, EvidenceRecord>,
    evidence_by_name: HashMap<(AttemptId, String), EvidenceId>,
    decisions: BTreeMap<DecisionId, Decision>,
    outcomes: Vec<OutcomeRecord>,
    blockers: BTreeMap<BlockerId, Blocker>,
    exceptions: Vec<GateException>,
}

impl RecordBook {
    pub fn evidence(&self, id: EvidenceId) -> Option<&EvidenceRecord> {
        self.evidence.get(&id)
    }

    pub fn evidence_for(&self, attempt_id: AttemptId) -> Vec<&EvidenceRecord> {
        self.evidence
            .values()
            .filter(|record| record.attempt_id == attempt_id)
            .collect()
    }

    pub fn decision(&self, id: DecisionId) -> Option<&Decision> {
        self.decisions.get(&id)
    }

    pub fn decisions_for(&self, attempt_id: AttemptId) -> Vec<&Decision> {
        self.decisions
            .values()
            .filter(|decision| decision.attempt_id == attempt_id)
            .collect()
    }

    pub fn outcomes_for(&self, attempt_id: AttemptId) -> Vec<&OutcomeRecord> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.attempt_id == attempt_id)
            .collect()
    }

    pub fn blocker(&self, id: BlockerId) -> Option<&Blocker> {
        self.blockers.get(&id)
    }

    /// Unresolved blockers raised against a work item.
    pub fn open_blockers(&self, work_id: &WorkId) -> Vec<&Blocker> {
        self.blockers
            .values()
            .filter(|blocker| &blocker.work_id == work_id && !blocker.is_resolved())
            .collect()
    }

    /// Gate exceptions granted to an attempt, live or not.
    pub fn exceptions_for(&self, attempt_id: AttemptId) -> Vec<GateException> {
        self.exceptions
            .iter()
            .filter(|exception| exception.attempt_id == attempt_id)
            .cloned()
            .collect()
    }

    pub(crate) fn check_evidence(
        &self,
        attempt_id: AttemptId,
        name: &str,
        hash: &Hash,
    ) -> Result<Recorded<EvidenceId>, CoordError> {
        let key = (attempt_id, name.to_string());
        match self.evidence_by_name.get(&key) {
            None => Ok(Recorded::New),
            Some(id) => match self.evidence.get(id) {
                Some(existing) if &existing.hash == hash => Ok(Recorded::Existing(*id)),
                _ => Err(IntegrityViolation::immutable(format!(
                    "evidence '{name}' of {attempt_id}"
                ))
                .into()),
            },
        }
    }

    pub(crate) fn check_decision(
        &self,
        attempt_id: AttemptId,
        text: &str,
        rationale: &str,
    ) -> Recorded<DecisionId> {
        self.decisions
            .values()
            .find(|decision| {
                decision.attempt_id == attempt_id
                    && decision.text == text
                    && decision.rationale == rationale
            })
            .map(|decision| Recorded::Existing(decision.id))
            .unwrap_or(Recorded::New)
    }

    /// Validate a resolution. `Existing` means the identical resolution is already recorded.
    pub(crate) fn check_resolution(
        &self,
        blocker_id: BlockerId,
        basis: &ResolutionBasis,
    ) -> Result<Recorded<()>, CoordError> {
        let blocker = self.blockers.get(&blocker_id).ok_or_else(|| {
            Violation::invalid("blocker_id", format!("blocker {blocker_id} does not exist"))
        })?;
        if let Some(existing) = &blocker.resolution {
            if &existing.basis == basis {
                return Ok(Recorded::Existing(()));
            }
            return Err(IntegrityViolation::immutable(format!("resolution of {blocker_id}")).into());
        }
        match basis {
            ResolutionBasis::Justification { text } if text.trim().is_empty() => {
                Err(Violation::missing(vec![Unmet::ResolutionJustification]).into())
            }
            ResolutionBasis::Evidence { evidence_id }
                if !self.evidence.contains_key(evidence_id) =>
            {
                Err(Violation::missing(vec![Unmet::EvidenceNotFound {
                    evidence_id: *evidence_id,
                }])
                .into())
            }
            _ => Ok(Recorded::New),
        }
    }

    pub(crate) fn insert_evidence(&mut self, record: &EvidenceRecord) {
        self.evidence_by_name
            .entry((record.attempt_id, record.name.clone()))
            .or_insert(record.id);
        self.evidence.entry(record.id).or_insert_with(|| record.clone());
    }

    pub(crate) fn insert_decision(&mut self, decision: &Decision) {
        self.decisions
            .entry(decision.id)
            .or_insert_with(|| decision.clone());
    }

    pub(crate) fn insert_exception(&mut self, exception: &GateException) {
        self.exceptions.push(exception.clone());
    }

    pub(crate) fn insert_outcome(&mut self, outcome: &OutcomeRecord) {
        self.outcomes.push(outcome.clone());
    }

    pub(crate) fn insert_blocker(&mut self, blocker: &Blocker) {
        self.blockers
            .entry(blocker.id)
            .or_insert_with(|| blocker.clone());
    }

    /// Returns the work item the blocker was raised against.
    pub(crate) fn resolve_blocker(
        &mut self,
        blocker_id: BlockerId,
        resolution: &BlockerResolution,
    ) -> Option<WorkId> {
        let blocker = self.blockers.get_mut(&blocker_id)?;
        if blocker.resolution.is_none() {
            blocker.resolution = Some(resolution.clone());
        }
        Some(blocker.work_id.clone())
    }
}

/// A gate exception must name its grantor, who cannot be the attempt's own claimant, and must
/// expire within `max_ttl_minutes`.
pub(crate) fn check_exception(
    claimant: &str,
    request: &GateExceptionRequest,
    max_ttl_minutes: u32,
) -> Result<(), CoordError> {
    if request.gate_id.trim().is_empty() {
        return Err(Violation::invalid("gate_id", "must not be empty").into());
    }
    if request.reason.trim().is_empty() {
        return Err(Violation::invalid("reason", "must not be empty").into());
    }
    let grantor = request.granted_by.trim();
    if grantor.is_empty() {
        return Err(Violation::invalid("granted_by", "must not be empty").into());
    }
    if grantor == claimant.trim() {
        return Err(Violation::invalid(
            "granted_by",
            format!("{grantor} holds the attempt and cannot excuse its gates"),
        )
        .into());
    }
    let ttl = request.ttl_minutes;
    if ttl == 0 || ttl > max_ttl_minutes {
        return Err(Violation::invalid(
            "ttl_minutes",
            format!("{ttl} is outside 1..={max_ttl_minutes}"),
        )
        .into());
    }
    Ok(())
}
