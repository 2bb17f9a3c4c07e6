#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use warden_kernel::config::DEFAULT_TARGET_REF;
use warden_kernel::{
    AttemptId, ClaimGrant, CompletionClaim, Coordinator, EvidenceInput, FixedHead, GateRun,
    GateStatus, GateTier, KernelConfig, ManualClock, PlanDraft, PlanSeal, ReleaseRequest,
    Requirements, RunReport, WorkId,
};
use warden_store::MemStore;
use warden_canon::Hash;

pub const START_MS: u64 = 1_700_000_000_000;
pub const SNAPSHOT: &str = "c0ffee00";

pub struct Harness {
    pub coord: Coordinator<MemStore>,
    pub clock: Arc<ManualClock>,
    pub heads: Arc<FixedHead>,
}

pub fn harness() -> Result<Harness> {
    harness_with(KernelConfig::default())
}

pub fn harness_with(config: KernelConfig) -> Result<Harness> {
    let clock = Arc::new(ManualClock::new(START_MS));
    let heads = Arc::new(FixedHead::with(DEFAULT_TARGET_REF, SNAPSHOT));
    let coord = Coordinator::builder(Arc::new(MemStore::new()))
        .config(config)
        .clock(clock.clone())
        .head_source(heads.clone())
        .open()?;
    Ok(Harness {
        coord,
        clock,
        heads,
    })
}

impl Harness {
    pub fn create(&self, id: &str) -> Result<WorkId> {
        let work_id = WorkId::from(id);
        self.coord
            .create_work_item(work_id.clone(), &format!("task {id}"), Requirements::default())?;
        Ok(work_id)
    }

    pub fn create_and_claim(&self, id: &str, claimant: &str) -> Result<ClaimGrant> {
        let work_id = self.create(id)?;
        Ok(self.coord.claim_work(&work_id, claimant)?)
    }

    pub fn seal(&self, attempt_id: AttemptId, gates: &[&str], scope: &[&str]) -> Result<PlanSeal> {
        Ok(self.coord.seal_plan(attempt_id, &draft(gates, scope))?)
    }

    /// Record one test result, seal, run every gate green and finalize. Returns the run hash.
    pub fn green_run(&self, attempt_id: AttemptId, gates: &[&str]) -> Result<Hash> {
        self.coord
            .record_evidence(attempt_id, evidence("tests", "test_result", b"ok"))?;
        self.seal(attempt_id, gates, &["src/**"])?;
        let finalized = self
            .coord
            .finalize_run(attempt_id, report(gates, &["src/lib.rs"]))?;
        Ok(finalized.run_hash)
    }
}

pub fn draft(gates: &[&str], scope: &[&str]) -> PlanDraft {
    PlanDraft {
        tier: GateTier::Standard,
        required_gates: gates.iter().map(|gate| gate.to_string()).collect(),
        scope: scope.iter().map(|pattern| pattern.to_string()).collect(),
        policy_versions: Default::default(),
    }
}

pub fn gate(id: &str, status: GateStatus) -> GateRun {
    GateRun {
        gate_id: id.to_string(),
        status,
        exit_code: Some(if status == GateStatus::Pass { 0 } else { 1 }),
        duration_ms: 250,
        stdout: format!("{id} output").into_bytes(),
        stderr: Vec::new(),
    }
}

pub fn report(passed_gates: &[&str], changed: &[&str]) -> RunReport {
    RunReport {
        source_snapshot: SNAPSHOT.to_string(),
        gates: passed_gates
            .iter()
            .map(|id| gate(id, GateStatus::Pass))
            .collect(),
        changed_paths: changed.iter().map(|path| path.to_string()).collect(),
        ..RunReport::default()
    }
}

pub fn evidence(name: &str, kind: &str, bytes: &[u8]) -> EvidenceInput {
    EvidenceInput {
        name: name.to_string(),
        kind: kind.to_string(),
        bytes: Some(bytes.to_vec()),
        ..EvidenceInput::default()
    }
}

pub fn done(run_hash: Option<Hash>) -> ReleaseRequest {
    ReleaseRequest::Done(CompletionClaim {
        run_hash,
        source_snapshot: SNAPSHOT.to_string(),
        ..CompletionClaim::default()
    })
}
