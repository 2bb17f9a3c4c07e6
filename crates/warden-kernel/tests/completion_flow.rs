mod helpers;

use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use helpers::{SNAPSHOT, START_MS, done, evidence, gate, harness, harness_with, report};
use warden_kernel::config::DEFAULT_TARGET_REF;
use warden_kernel::journal::JournalRecord;
use warden_kernel::{
    ArtifactKind, CompletionClaim, CompletionFailure, CoordError, EvidenceInput, GateException,
    GateExceptionRequest, GateStatus, HeadAttestation, KernelConfig, OutcomeInput, ReleaseOutcome,
    ReleaseRequest, Requirements, Signer, Unmet, VerifyOutcome, Violation, WorkId, WorkStatus,
};
use warden_canon::Hash;
use warden_store::Store;

#[test]
fn done_without_evidence_is_refused_and_audited() -> Result<()> {
    let h = harness()?;
    let grant = h.create_and_claim("W1", "alice")?;

    let err = h.coord.release_work(grant.attempt.id, done(None)).unwrap_err();
    assert_eq!(err.code(), "EvidenceRequired");
    assert!(!err.is_retryable());

    let log = h.coord.audit_log(0)?.value;
    let rejected = log
        .iter()
        .find_map(|entry| match &entry.record {
            JournalRecord::Rejected(rejected) => Some(rejected),
            _ => None,
        })
        .context("rejection should be journaled")?;
    assert_eq!(rejected.operation, "release_work");
    assert_eq!(rejected.code, "EvidenceRequired");
    assert_eq!(rejected.attempt_id, Some(grant.attempt.id));

    let attempt = h.coord.attempt(grant.attempt.id)?.value.context("attempt")?;
    ensure!(attempt.is_open(), "refused completion must leave the attempt open");
    Ok(())
}

#[test]
fn completion_binds_to_a_green_run() -> Result<()> {
    let h = harness()?;
    let w1 = h.create("W1")?;
    let w2 = h.create("W2")?;
    h.coord.add_dependency(&w2, &w1)?;
    let grant = h.coord.claim_work(&w1, "alice")?;
    let run_hash = h.green_run(grant.attempt.id, &["unit"])?;

    let ReleaseOutcome::Completed { receipt } =
        h.coord.release_work(grant.attempt.id, done(Some(run_hash)))?
    else {
        bail!("expected completion");
    };
    assert_eq!(receipt.run_hash, run_hash);
    assert_eq!(receipt.source_snapshot, SNAPSHOT);
    assert!(receipt.satisfied_gates.contains("unit"));
    assert!(!receipt.head_attested);

    assert_eq!(
        h.coord.work_item(&w1)?.value.context("item")?.status,
        WorkStatus::Completed
    );
    assert_eq!(
        h.coord.receipt(grant.attempt.id)?.value,
        Some(receipt.clone())
    );
    let stored: warden_kernel::CompletionReceipt = h.coord.store().get_node(
        h.coord
            .attempt(grant.attempt.id)?
            .value
            .and_then(|attempt| attempt.receipt)
            .context("receipt hash")?,
    )?;
    assert_eq!(stored, receipt);

    // Resubmitting returns the recorded receipt.
    let again = h.coord.release_work(grant.attempt.id, done(Some(run_hash)))?;
    assert_eq!(again, ReleaseOutcome::Completed { receipt });

    let err = h.coord.claim_work(&w1, "bob").unwrap_err();
    assert_eq!(
        err.missing_prereqs().map(|m| m.unmet.clone()),
        Some(vec![Unmet::WorkItemCompleted { work_id: w1 }])
    );
    h.coord.claim_work(&w2, "bob")?;
    Ok(())
}

#[test]
fn untracked_paths_fail_reconciliation_and_completion() -> Result<()> {
    let h = harness()?;
    let grant = h.create_and_claim("W1", "alice")?;
    let attempt_id = grant.attempt.id;
    h.coord
        .record_evidence(attempt_id, evidence("tests", "test_result", b"ok"))?;
    h.seal(attempt_id, &["unit"], &["src/**"])?;

    let finalized = h
        .coord
        .finalize_run(attempt_id, report(&["unit"], &["src/x.py", "README.md"]))?;
    assert_eq!(finalized.manifest.untracked_delta_paths, vec!["README.md".to_string()]);
    assert_eq!(finalized.verdict.outcome, VerifyOutcome::UntrackedDelta);
    let run = h
        .coord
        .runs()?
        .value
        .into_iter()
        .next()
        .context("run entry")?;
    assert_eq!(run.verdict, VerifyOutcome::UntrackedDelta);

    let err = h
        .coord
        .release_work(attempt_id, done(Some(finalized.run_hash)))
        .unwrap_err();
    assert_eq!(err.code(), "COMPLETE.RECON_UNTRACKED_DELTA");
    match err {
        CoordError::Policy(Violation::Completion(CompletionFailure::ReconUntrackedDelta {
            paths,
        })) => assert_eq!(paths, vec!["README.md".to_string()]),
        other => bail!("expected an untracked delta refusal, got {other}"),
    }
    Ok(())
}

#[test]
fn failed_gates_need_a_live_exception() -> Result<()> {
    let h = harness()?;
    let grant = h.create_and_claim("W1", "alice")?;
    let attempt_id = grant.attempt.id;
    h.coord
        .record_evidence(attempt_id, evidence("tests", "test_result", b"1 failed"))?;
    h.seal(attempt_id, &["unit", "lint"], &["src/**"])?;
    let mut run = report(&["unit"], &["src/lib.rs"]);
    run.gates.push(gate("lint", GateStatus::Fail));
    let finalized = h.coord.finalize_run(attempt_id, run)?;
    assert!(finalized.verdict.outcome.is_pass());

    let err = h
        .coord
        .release_work(attempt_id, done(Some(finalized.run_hash)))
        .unwrap_err();
    assert_eq!(err.code(), "COMPLETE.GATE_FAILED");

    let exception = |granted_by: &str, ttl_minutes| GateExceptionRequest {
        gate_id: "lint".into(),
        reason: "style-only findings".into(),
        granted_by: granted_by.into(),
        ttl_minutes,
    };
    let err = h
        .coord
        .grant_gate_exception(attempt_id, exception(" alice", 10))
        .unwrap_err();
    assert_eq!(err.code(), "InvalidRequest");
    let err = h
        .coord
        .grant_gate_exception(attempt_id, exception("lead", 24 * 60 + 1))
        .unwrap_err();
    assert_eq!(err.code(), "InvalidRequest");

    let short = h
        .coord
        .grant_gate_exception(attempt_id, exception("lead", 1))?;
    assert_eq!(short.attempt_id, attempt_id);
    assert_eq!(short.expires_at, START_MS + 60_000);
    h.clock.advance(Duration::from_secs(90));
    let err = h
        .coord
        .release_work(attempt_id, done(Some(finalized.run_hash)))
        .unwrap_err();
    assert_eq!(err.code(), "COMPLETE.GATE_FAILED");

    h.coord
        .grant_gate_exception(attempt_id, exception("lead", 10))?;
    let ReleaseOutcome::Completed { receipt } = h
        .coord
        .release_work(attempt_id, done(Some(finalized.run_hash)))?
    else {
        bail!("expected completion");
    };
    assert!(receipt.excepted_gates.contains("lint"));
    assert!(receipt.satisfied_gates.contains("unit"));

    let log = h.coord.audit_log(0)?.value;
    let granted: Vec<&GateException> = log
        .iter()
        .filter_map(|entry| match &entry.record {
            JournalRecord::GateExceptionGranted(exception) => Some(exception),
            _ => None,
        })
        .collect();
    assert_eq!(granted.len(), 2);
    ensure!(
        granted.iter().all(|exception| exception.granted_by == "lead"),
        "only the independent grants are journaled as exceptions"
    );
    Ok(())
}

#[test]
fn exceptions_need_an_open_attempt_and_a_positive_ttl() -> Result<()> {
    let h = harness()?;
    let first = h.create_and_claim("W1", "alice")?;
    let err = h
        .coord
        .grant_gate_exception(
            first.attempt.id,
            GateExceptionRequest {
                gate_id: "unit".into(),
                reason: "no runner".into(),
                granted_by: "lead".into(),
                ttl_minutes: 0,
            },
        )
        .unwrap_err();
    assert_eq!(err.code(), "InvalidRequest");

    h.coord.release_work(
        first.attempt.id,
        ReleaseRequest::Abandon {
            reason: Some("stuck".into()),
        },
    )?;
    let err = h
        .coord
        .grant_gate_exception(
            first.attempt.id,
            GateExceptionRequest {
                gate_id: "unit".into(),
                reason: "no runner".into(),
                granted_by: "lead".into(),
                ttl_minutes: 5,
            },
        )
        .unwrap_err();
    assert_eq!(err.code(), "AttemptNotOpen");
    Ok(())
}

#[test]
fn completion_only_binds_runs_from_its_own_handoff_chain() -> Result<()> {
    let h = harness()?;
    let first = h.create_and_claim("W1", "alice")?;
    let alice_run = h.green_run(first.attempt.id, &["unit"])?;
    h.coord
        .release_work(first.attempt.id, ReleaseRequest::Abandon { reason: None })?;

    let work_id = WorkId::from("W1");
    let second = h.coord.claim_work(&work_id, "bob")?;
    h.coord
        .record_evidence(second.attempt.id, evidence("notes", "review", b"lgtm"))?;
    for claim in [done(None), done(Some(alice_run))] {
        let err = h
            .coord
            .release_work(second.attempt.id, claim)
            .unwrap_err();
        assert_eq!(err.code(), "COMPLETE.EVIDENCE_MISSING");
    }

    let bob_run = h.green_run(second.attempt.id, &["unit"])?;
    let ReleaseOutcome::HandedOff { successor, .. } = h.coord.release_work(
        second.attempt.id,
        ReleaseRequest::Handoff {
            to_claimant: "carol".into(),
            reason: "out of office".into(),
        },
    )?
    else {
        bail!("expected a handoff");
    };
    h.coord
        .record_evidence(successor.id, evidence("notes", "review", b"checked"))?;
    let err = h
        .coord
        .release_work(successor.id, done(Some(alice_run)))
        .unwrap_err();
    assert_eq!(err.code(), "COMPLETE.EVIDENCE_MISSING");

    let ReleaseOutcome::Completed { receipt } = h.coord.release_work(successor.id, done(None))?
    else {
        bail!("expected completion");
    };
    assert_eq!(receipt.run_hash, bob_run);
    Ok(())
}

#[test]
fn stale_snapshots_need_a_trusted_attestation() -> Result<()> {
    let attester = Signer::from_seed([9u8; 32]);
    let h = harness_with(KernelConfig {
        trusted_attesters: vec![attester.public_key_hex()],
        ..KernelConfig::default()
    })?;
    let grant = h.create_and_claim("W1", "alice")?;
    let run_hash = h.green_run(grant.attempt.id, &["unit"])?;
    h.heads.set(DEFAULT_TARGET_REF, "beefcafe")?;

    let err = h
        .coord
        .release_work(grant.attempt.id, done(Some(run_hash)))
        .unwrap_err();
    assert_eq!(err.code(), "COMPLETE.SOURCE_NOT_HEAD");

    let mismatched = CompletionClaim {
        run_hash: Some(run_hash),
        source_snapshot: "beefcafe".into(),
        ..CompletionClaim::default()
    };
    let err = h
        .coord
        .release_work(grant.attempt.id, ReleaseRequest::Done(mismatched))
        .unwrap_err();
    assert_eq!(err.code(), "COMPLETE.SOURCE_STATE_MISMATCH");

    let untrusted = Signer::from_seed([3u8; 32]);
    let claim = CompletionClaim {
        run_hash: Some(run_hash),
        source_snapshot: SNAPSHOT.into(),
        attestation: Some(HeadAttestation::sign(&untrusted, DEFAULT_TARGET_REF, SNAPSHOT)?),
        ..CompletionClaim::default()
    };
    let err = h
        .coord
        .release_work(grant.attempt.id, ReleaseRequest::Done(claim.clone()))
        .unwrap_err();
    assert_eq!(err.code(), "COMPLETE.SOURCE_NOT_HEAD");

    let trusted = CompletionClaim {
        attestation: Some(HeadAttestation::sign(&attester, DEFAULT_TARGET_REF, SNAPSHOT)?),
        ..claim
    };
    let ReleaseOutcome::Completed { receipt } = h
        .coord
        .release_work(grant.attempt.id, ReleaseRequest::Done(trusted))?
    else {
        bail!("expected completion");
    };
    assert!(receipt.head_attested);
    Ok(())
}

#[test]
fn unknown_or_tampered_run_hashes_are_refused() -> Result<()> {
    let h = harness()?;
    let grant = h.create_and_claim("W1", "alice")?;
    h.coord
        .record_evidence(grant.attempt.id, evidence("tests", "test_result", b"ok"))?;

    let err = h.coord.release_work(grant.attempt.id, done(None)).unwrap_err();
    assert_eq!(err.code(), "COMPLETE.EVIDENCE_MISSING");

    let err = h
        .coord
        .release_work(grant.attempt.id, done(Some(Hash::of_bytes(b"elsewhere"))))
        .unwrap_err();
    assert_eq!(err.code(), "COMPLETE.EVIDENCE_MISSING");
    Ok(())
}

#[test]
fn contract_evidence_kinds_are_enforced() -> Result<()> {
    let h = harness()?;
    let w1 = WorkId::from("W1");
    h.coord.create_work_item(
        w1.clone(),
        "needs a diff",
        Requirements {
            required_evidence: vec![ArtifactKind::Diff],
            ..Requirements::default()
        },
    )?;
    let grant = h.coord.claim_work(&w1, "alice")?;
    assert!(grant.contract.required_evidence.contains(&ArtifactKind::Diff));
    let run_hash = h.green_run(grant.attempt.id, &["unit"])?;

    let err = h
        .coord
        .release_work(grant.attempt.id, done(Some(run_hash)))
        .unwrap_err();
    assert_eq!(
        err.missing_prereqs().map(|m| m.unmet.clone()),
        Some(vec![Unmet::Evidence {
            kind: ArtifactKind::Diff
        }])
    );

    h.coord
        .record_evidence(grant.attempt.id, evidence("patch", "diff", b"--- a\n+++ b\n"))?;
    h.coord.release_work(grant.attempt.id, done(Some(run_hash)))?;
    Ok(())
}

#[test]
fn evidence_is_write_once() -> Result<()> {
    let h = harness()?;
    let grant = h.create_and_claim("W1", "alice")?;
    let attempt_id = grant.attempt.id;

    let first = h
        .coord
        .record_evidence(attempt_id, evidence("tests", "test_result", b"ok"))?;
    let again = h
        .coord
        .record_evidence(attempt_id, evidence("tests", "test_result", b"ok"))?;
    assert_eq!(first, again);

    let err = h
        .coord
        .record_evidence(attempt_id, evidence("tests", "test_result", b"changed"))
        .unwrap_err();
    assert_eq!(err.code(), "IMMUTABLE_RECORD");

    let err = h
        .coord
        .record_evidence(attempt_id, evidence("video", "screencast", b"..."))
        .unwrap_err();
    assert_eq!(err.code(), "InvalidArtifactType");

    let err = h
        .coord
        .record_evidence(
            attempt_id,
            EvidenceInput {
                hash: Some(Hash::of_bytes(b"something else")),
                ..evidence("log", "log", b"actual bytes")
            },
        )
        .unwrap_err();
    assert_eq!(err.code(), "HASH_MISMATCH");

    let missing = Hash::of_bytes(b"never stored");
    let err = h
        .coord
        .record_evidence(
            attempt_id,
            EvidenceInput {
                name: "by-hash".into(),
                kind: "log".into(),
                hash: Some(missing),
                ..EvidenceInput::default()
            },
        )
        .unwrap_err();
    assert_eq!(
        err.missing_prereqs().map(|m| m.unmet.clone()),
        Some(vec![Unmet::Artifact { hash: missing }])
    );

    // A blob already in the store can be referenced by hash alone.
    let stored = h.coord.store().put_blob(b"shared log")?;
    h.coord.record_evidence(
        attempt_id,
        EvidenceInput {
            name: "shared".into(),
            kind: "log".into(),
            hash: Some(stored),
            ..EvidenceInput::default()
        },
    )?;

    let context = h.coord.get_context(attempt_id)?.value;
    assert_eq!(context.evidence.len(), 2);
    Ok(())
}

#[test]
fn decisions_and_outcomes_are_append_only() -> Result<()> {
    let h = harness()?;
    let grant = h.create_and_claim("W1", "alice")?;
    let attempt_id = grant.attempt.id;

    let decision = h
        .coord
        .record_decision(attempt_id, "use sqlite", "single node, no server")?;
    let same = h
        .coord
        .record_decision(attempt_id, "use sqlite", "single node, no server")?;
    assert_eq!(decision, same);
    let err = h.coord.record_decision(attempt_id, "  ", "why").unwrap_err();
    assert_eq!(err.code(), "InvalidRequest");

    let outcome = OutcomeInput {
        summary: Some("schema drafted".into()),
        payload: serde_json::json!({"tables": ["work", "attempts"]}),
    };
    let first = h.coord.put_outcome(attempt_id, outcome.clone())?;
    let second = h.coord.put_outcome(attempt_id, outcome)?;
    assert_eq!(first, second);

    h.coord
        .release_work(attempt_id, ReleaseRequest::Abandon { reason: None })?;
    // Decisions may still be appended to a closed attempt; outcomes may not.
    h.coord
        .record_decision(attempt_id, "revisit later", "priorities changed")?;
    let err = h
        .coord
        .put_outcome(
            attempt_id,
            OutcomeInput {
                summary: None,
                payload: serde_json::json!({}),
            },
        )
        .unwrap_err();
    assert_eq!(err.code(), "AttemptNotOpen");

    let context = h.coord.get_context(attempt_id)?.value;
    assert_eq!(context.decisions.len(), 2);
    assert_eq!(context.outcomes.len(), 1);
    Ok(())
}
