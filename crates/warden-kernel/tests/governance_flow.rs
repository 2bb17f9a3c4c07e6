mod helpers;

use std::fs;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use helpers::{draft, evidence, gate, harness, harness_with, report};
use tempfile::TempDir;
use warden_kernel::bundle::layout::load_bundle;
use warden_kernel::journal::JournalRecord;
use warden_kernel::{
    ActionKind, ActionRequest, AttemptId, GateStatus, KernelConfig, NamedArtifact, Permit,
    PermitConstraints, PermitRequest, SealStrength, StandardsCatalog, Unmet, VerifyOutcome,
    VerifyPolicy, verify_manifest,
};
use warden_canon::Hash;

fn write_permit(target: &str) -> PermitRequest {
    PermitRequest {
        action: ActionKind::FileWrite,
        target: target.to_string(),
        constraints: PermitConstraints {
            max_bytes: Some(1024),
            ..PermitConstraints::default()
        },
        ttl_minutes: None,
    }
}

fn write_action(permit: Option<Permit>, target: &str, bytes: Option<u64>) -> ActionRequest {
    ActionRequest {
        permit,
        action: ActionKind::FileWrite,
        target: target.to_string(),
        bytes,
        operation: None,
        timeout_secs: None,
        exit_code: None,
    }
}

#[test]
fn unexecuted_sealed_gate_refuses_finalization() -> Result<()> {
    let h = harness()?;
    let grant = h.create_and_claim("W1", "alice")?;
    h.seal(grant.attempt.id, &["g1", "g2"], &["src/**"])?;

    let err = h
        .coord
        .finalize_run(grant.attempt.id, report(&["g1"], &["src/lib.rs"]))
        .unwrap_err();
    assert_eq!(err.code(), "SEAL.MISSING_GATES");
    assert_eq!(err.to_string(), "SEAL.MISSING_GATES: {g2}");
    assert!(h.coord.runs()?.value.is_empty());
    Ok(())
}

#[test]
fn executed_plan_must_match_the_seal() -> Result<()> {
    let h = harness()?;
    let grant = h.create_and_claim("W1", "alice")?;
    let attempt_id = grant.attempt.id;

    let err = h
        .coord
        .finalize_run(attempt_id, report(&["unit"], &[]))
        .unwrap_err();
    assert_eq!(
        err.missing_prereqs().map(|m| m.unmet.clone()),
        Some(vec![Unmet::PlanSeal { attempt_id }])
    );

    h.seal(attempt_id, &["unit"], &["src/**"])?;
    let mut run = report(&["unit"], &["src/lib.rs"]);
    run.plan_hash = Some(Hash::of_bytes(b"some other plan"));
    let err = h.coord.finalize_run(attempt_id, run).unwrap_err();
    assert_eq!(err.code(), "SEAL.PLAN_MISMATCH");
    Ok(())
}

#[test]
fn contract_gates_cannot_be_left_out_of_the_plan() -> Result<()> {
    let h = harness_with(KernelConfig {
        standards: StandardsCatalog {
            required_gates: vec!["unit".into()],
            ..StandardsCatalog::default()
        },
        ..KernelConfig::default()
    })?;
    let grant = h.create_and_claim("W1", "alice")?;
    let err = h
        .coord
        .seal_plan(grant.attempt.id, &draft(&["lint"], &["src/**"]))
        .unwrap_err();
    assert_eq!(err.code(), "SEAL.MISSING_GATES");
    h.seal(grant.attempt.id, &["lint", "unit"], &["src/**"])?;
    Ok(())
}

#[test]
fn one_active_seal_per_attempt_until_a_run_spends_it() -> Result<()> {
    let h = harness()?;
    let grant = h.create_and_claim("W1", "alice")?;
    let attempt_id = grant.attempt.id;

    let first = h.seal(attempt_id, &["unit"], &["src/**"])?;
    let again = h.seal(attempt_id, &["unit"], &["src/**"])?;
    assert_eq!(first, again);

    let err = h
        .coord
        .seal_plan(attempt_id, &draft(&["unit", "lint"], &["src/**"]))
        .unwrap_err();
    assert_eq!(err.code(), "IMMUTABLE_RECORD");

    h.coord
        .record_evidence(attempt_id, evidence("tests", "test_result", b"ok"))?;
    h.coord
        .finalize_run(attempt_id, report(&["unit"], &["src/lib.rs"]))?;

    let err = h
        .coord
        .issue_permit(attempt_id, write_permit("src/lib.rs"))
        .unwrap_err();
    assert_eq!(
        err.missing_prereqs().map(|m| m.unmet.clone()),
        Some(vec![Unmet::PlanSeal { attempt_id }])
    );
    let second = h.seal(attempt_id, &["unit", "lint"], &["src/**"])?;
    assert_ne!(second.plan_hash, first.plan_hash);
    let attempt = h.coord.attempt(attempt_id)?.value.context("attempt")?;
    assert_eq!(attempt.seals, vec![first.plan_hash, second.plan_hash]);
    Ok(())
}

#[test]
fn permits_are_single_use_and_denials_are_recorded() -> Result<()> {
    let h = harness()?;
    let grant = h.create_and_claim("W1", "alice")?;
    let attempt_id = grant.attempt.id;
    let seal = h.seal(attempt_id, &["unit"], &["src/**"])?;

    let permit = h.coord.issue_permit(attempt_id, write_permit("src/lib.rs"))?;
    assert_eq!(permit.body.seal_hash, seal.plan_hash);
    assert_eq!(permit.body.expires_at - permit.body.issued_at, 10 * 60_000);

    let err = h
        .coord
        .authorize_action(attempt_id, write_action(None, "src/lib.rs", Some(10)))
        .unwrap_err();
    assert_eq!(err.code(), "NO_PERMIT");

    let err = h
        .coord
        .authorize_action(
            attempt_id,
            write_action(Some(permit.clone()), "src/main.rs", Some(10)),
        )
        .unwrap_err();
    assert_eq!(err.code(), "PERMIT_MISMATCH");

    let err = h
        .coord
        .authorize_action(attempt_id, write_action(Some(permit.clone()), "src/lib.rs", None))
        .unwrap_err();
    assert_eq!(err.code(), "CONSTRAINT_VIOLATION");

    let consumed = h.coord.authorize_action(
        attempt_id,
        write_action(Some(permit.clone()), "src/lib.rs", Some(100)),
    )?;
    assert_eq!(consumed.id, permit.id);

    let err = h
        .coord
        .authorize_action(attempt_id, write_action(Some(permit), "src/lib.rs", Some(100)))
        .unwrap_err();
    assert_eq!(err.code(), "NO_PERMIT");

    let log = h.coord.audit_log(0)?.value;
    let denials = log
        .iter()
        .filter(|entry| matches!(entry.record, JournalRecord::ActionDenied(_)))
        .count();
    assert_eq!(denials, 4);
    let rejected_authorization = log.iter().any(|entry| {
        matches!(&entry.record, JournalRecord::Rejected(r) if r.operation == "authorize_action")
    });
    ensure!(
        !rejected_authorization,
        "permit denials are journaled once, as denials"
    );

    h.coord
        .record_evidence(attempt_id, evidence("tests", "test_result", b"ok"))?;
    let finalized = h
        .coord
        .finalize_run(attempt_id, report(&["unit"], &["src/lib.rs"]))?;
    assert_eq!(finalized.manifest.unpermitted_attempts.len(), 4);
    assert_eq!(finalized.manifest.unpermitted_attempts[0].code, "NO_PERMIT");
    Ok(())
}

#[test]
fn permits_expire_and_ttl_is_bounded() -> Result<()> {
    let h = harness()?;
    let grant = h.create_and_claim("W1", "alice")?;
    let attempt_id = grant.attempt.id;
    h.seal(attempt_id, &["unit"], &["src/**"])?;

    for ttl in [0, 31] {
        let err = h
            .coord
            .issue_permit(
                attempt_id,
                PermitRequest {
                    ttl_minutes: Some(ttl),
                    ..write_permit("src/lib.rs")
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), "InvalidRequest");
    }

    let permit = h.coord.issue_permit(
        attempt_id,
        PermitRequest {
            ttl_minutes: Some(1),
            ..write_permit("src/lib.rs")
        },
    )?;
    h.clock.advance(Duration::from_secs(61));
    let err = h
        .coord
        .authorize_action(attempt_id, write_action(Some(permit), "src/lib.rs", Some(1)))
        .unwrap_err();
    assert_eq!(err.code(), "PERMIT_EXPIRED");
    Ok(())
}

#[test]
fn permits_bound_to_another_attempt_are_refused() -> Result<()> {
    let h = harness()?;
    let first = h.create_and_claim("W1", "alice")?;
    let second = h.create_and_claim("W2", "bob")?;
    h.seal(first.attempt.id, &["unit"], &["src/**"])?;
    h.seal(second.attempt.id, &["unit"], &["src/**"])?;
    let permit = h.coord.issue_permit(first.attempt.id, write_permit("src/lib.rs"))?;

    let err = h
        .coord
        .authorize_action(
            second.attempt.id,
            write_action(Some(permit), "src/lib.rs", Some(1)),
        )
        .unwrap_err();
    assert!(matches!(err.code(), "SEAL_MISMATCH" | "NO_PERMIT"));
    Ok(())
}

#[test]
fn signed_strength_signs_and_checks_everything() -> Result<()> {
    let h = harness_with(KernelConfig {
        seal_strength: SealStrength::Signed,
        signing_seed_hex: Some("07".repeat(32)),
        ..KernelConfig::default()
    })?;
    let public_key = h.coord.public_key_hex().context("signing key")?;
    let grant = h.create_and_claim("W1", "alice")?;
    let attempt_id = grant.attempt.id;

    let seal = h.seal(attempt_id, &["unit"], &["src/**"])?;
    assert_eq!(
        seal.signature.as_ref().map(|sig| sig.public_key.as_str()),
        Some(public_key.as_str())
    );

    let permit = h.coord.issue_permit(attempt_id, write_permit("src/lib.rs"))?;
    ensure!(permit.signature.is_some(), "signed permits carry a signature");

    let mut forged = permit.clone();
    forged.body.target = "/etc/passwd".into();
    let err = h
        .coord
        .authorize_action(attempt_id, write_action(Some(forged.clone()), "/etc/passwd", Some(1)))
        .unwrap_err();
    assert_eq!(err.code(), "NO_PERMIT");

    forged.id = forged.recompute_id()?;
    let err = h
        .coord
        .authorize_action(attempt_id, write_action(Some(forged), "/etc/passwd", Some(1)))
        .unwrap_err();
    assert_eq!(err.code(), "NO_PERMIT");

    h.coord
        .authorize_action(attempt_id, write_action(Some(permit), "src/lib.rs", Some(1)))?;

    h.coord
        .record_evidence(attempt_id, evidence("tests", "test_result", b"ok"))?;
    let finalized = h
        .coord
        .finalize_run(attempt_id, report(&["unit"], &["src/lib.rs"]))?;
    assert_eq!(
        finalized
            .manifest
            .signature
            .as_ref()
            .map(|sig| sig.public_key.clone()),
        Some(public_key)
    );
    assert_eq!(finalized.verdict.outcome, VerifyOutcome::Pass);
    Ok(())
}

#[test]
fn finalized_bundles_land_on_disk_and_verify_independently() -> Result<()> {
    let tmp = TempDir::new()?;
    let h = harness_with(KernelConfig {
        bundle_root: Some(tmp.path().to_path_buf()),
        ..KernelConfig::default()
    })?;
    let grant = h.create_and_claim("W1", "alice")?;
    let attempt_id = grant.attempt.id;
    h.coord
        .record_evidence(attempt_id, evidence("tests", "test_result", b"ok"))?;
    h.seal(attempt_id, &["unit"], &["src/**"])?;

    let mut run = report(&["unit"], &["src/lib.rs"]);
    run.run_id = Some("run-0001".into());
    run.artifacts.push(warden_kernel::NamedArtifact {
        path: "diffs/change.patch".into(),
        bytes: b"+fn main() {}\n".to_vec(),
    });
    let finalized = h.coord.finalize_run(attempt_id, run.clone())?;
    let dir = finalized.bundle_dir.clone().context("bundle dir")?;
    assert_eq!(dir, tmp.path().join("run-0001"));

    let (manifest, artifacts) = load_bundle(&dir)?;
    assert_eq!(manifest, finalized.manifest);
    let verdict = verify_manifest(&manifest, &artifacts, &VerifyPolicy::default());
    assert_eq!(verdict.outcome, VerifyOutcome::Pass);

    // Resubmitting the same run id returns the recorded run.
    let again = h.coord.finalize_run(attempt_id, run.clone())?;
    assert_eq!(again.run_hash, finalized.run_hash);
    assert_eq!(again.evidence_id, finalized.evidence_id);
    assert_eq!(h.coord.runs()?.value.len(), 1);

    let context = h.coord.get_context(attempt_id)?.value;
    let bundle_evidence = context
        .evidence
        .iter()
        .find(|record| record.name == "run:run-0001")
        .context("bundle evidence")?;
    assert_eq!(bundle_evidence.kind, warden_kernel::ArtifactKind::Bundle);
    assert_eq!(bundle_evidence.hash, finalized.manifest_hash);
    assert_eq!(
        h.coord.run(&finalized.run_hash)?.value,
        Some(finalized.manifest.clone())
    );

    fs::write(dir.join("diffs/change.patch"), b"+fn evil() {}\n")?;
    let (manifest, artifacts) = load_bundle(&dir)?;
    let verdict = verify_manifest(&manifest, &artifacts, &VerifyPolicy::default());
    assert_eq!(verdict.outcome, VerifyOutcome::ArtifactMismatch);

    let other = h.create_and_claim("W2", "bob")?;
    h.seal(other.attempt.id, &["unit"], &["src/**"])?;
    let err = h.coord.finalize_run(other.attempt.id, run).unwrap_err();
    assert_eq!(err.code(), "IMMUTABLE_RECORD");

    let mut escaping = report(&["unit"], &[]);
    escaping.artifacts.push(warden_kernel::NamedArtifact {
        path: "../outside".into(),
        bytes: Vec::new(),
    });
    let err = h
        .coord
        .finalize_run(other.attempt.id, escaping)
        .unwrap_err();
    assert_eq!(err.code(), "InvalidRequest");
    assert!(h.coord.attempt(AttemptId(99))?.value.is_none());
    Ok(())
}

#[test]
fn empty_or_escaping_scope_patterns_cannot_be_sealed() -> Result<()> {
    let h = harness()?;
    let grant = h.create_and_claim("W1", "alice")?;
    for scope in [vec![""], vec!["src/**", " "], vec!["./"], vec!["../**"]] {
        let err = h
            .coord
            .seal_plan(grant.attempt.id, &draft(&["unit"], &scope))
            .unwrap_err();
        assert_eq!(err.code(), "InvalidRequest", "scope {scope:?} was sealed");
    }
    let attempt = h.coord.attempt(grant.attempt.id)?.value.context("attempt")?;
    ensure!(attempt.seals.is_empty(), "refused scopes must not seal");
    Ok(())
}

#[test]
fn parent_segments_in_changed_paths_cannot_dodge_scope() -> Result<()> {
    let h = harness()?;
    let grant = h.create_and_claim("W1", "alice")?;
    h.seal(grant.attempt.id, &["unit"], &["src/**"])?;
    let finalized = h.coord.finalize_run(
        grant.attempt.id,
        report(&["unit"], &["src/lib.rs", "src/../README.md", "src/../../outside.txt"]),
    )?;
    assert_eq!(
        finalized.manifest.untracked_delta_paths,
        vec!["README.md".to_string(), "src/../../outside.txt".to_string()]
    );
    assert_eq!(finalized.verdict.outcome, VerifyOutcome::UntrackedDelta);
    Ok(())
}

#[test]
fn colliding_report_contents_are_refused() -> Result<()> {
    let h = harness()?;
    let grant = h.create_and_claim("W1", "alice")?;
    let attempt_id = grant.attempt.id;
    h.seal(attempt_id, &["unit"], &["src/**"])?;

    let artifact = |path: &str| NamedArtifact {
        path: path.into(),
        bytes: b"42 passed".to_vec(),
    };
    let mut repeated_gate = report(&["unit"], &["src/lib.rs"]);
    repeated_gate.gates.push(gate("unit", GateStatus::Fail));
    let shared_logs = report(&["unit", "a b", "a_b"], &["src/lib.rs"]);
    let mut shadowed_log = report(&["unit"], &["src/lib.rs"]);
    shadowed_log.artifacts.push(artifact("logs/unit.stdout.log"));
    let mut shadowed_manifest = report(&["unit"], &["src/lib.rs"]);
    shadowed_manifest.artifacts.push(artifact("manifest.json"));
    let mut listed_twice = report(&["unit"], &["src/lib.rs"]);
    listed_twice.artifacts.push(artifact("diffs/change.patch"));
    listed_twice.artifacts.push(artifact("diffs/change.patch"));

    for run in [
        repeated_gate,
        shared_logs,
        shadowed_log,
        shadowed_manifest,
        listed_twice,
    ] {
        let err = h.coord.finalize_run(attempt_id, run).unwrap_err();
        assert_eq!(err.code(), "InvalidRequest");
    }
    ensure!(h.coord.runs()?.value.is_empty(), "no colliding run may be recorded");

    let finalized = h
        .coord
        .finalize_run(attempt_id, report(&["unit"], &["src/lib.rs"]))?;
    assert!(finalized.manifest.gate_passed("unit"));
    Ok(())
}
