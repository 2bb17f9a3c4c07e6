//! Sealed plans, permits for side effects, and finalization of governed runs.

use super::*;

use crate::bundle::GateStatus;
use crate::bundle::layout::{check_artifact_path, log_path};
use crate::permit::PermitDenial;
use crate::seal::SealViolation;

/// A finalized run as returned to the executor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedRun {
    pub run_hash: Hash,
    pub manifest_hash: Hash,
    pub manifest: RunManifest,
    /// Verifier outcome over the stored bundle. A failing verdict is still recorded.
    pub verdict: VerifyReport,
    pub evidence_id: EvidenceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_dir: Option<PathBuf>,
}

impl<S: Store + 'static> Coordinator<S> {
    /// Seal an execution plan for an open attempt. Sealing the identical plan again returns the
    /// active seal; a different plan while one is active is refused.
    pub fn seal_plan(&self, attempt_id: AttemptId, draft: &PlanDraft) -> CoordResult<PlanSeal> {
        self.transact("seal_plan", Scope::attempt(attempt_id), |txn| {
            txn.sweep_attempt(attempt_id)?;
            let attempt = txn.state().attempts.check_open(attempt_id)?.clone();
            let contract = self.load_contract(attempt.contract_hash)?;
            let plan = SealedPlan::from_draft(
                draft,
                attempt_id,
                &attempt.work_id,
                attempt.contract_hash,
                &contract,
            )?;
            let seal = PlanSeal::seal(
                plan,
                txn.now,
                self.config.seal_strength,
                self.signer.as_ref(),
            )?;
            if let Recorded::Existing(active) =
                txn.state().seals.check_seal(attempt_id, &seal.plan_hash)?
            {
                if let Some(existing) = txn.state().seals.get(&active) {
                    return Ok(existing.clone());
                }
            }
            txn.commit(JournalRecord::PlanSealed(seal.clone()))?;
            log::info!("{attempt_id} sealed plan {}", seal.plan_hash);
            Ok(seal)
        })
    }

    /// Issue a single-use permit bound to the attempt's active seal.
    pub fn issue_permit(
        &self,
        attempt_id: AttemptId,
        request: PermitRequest,
    ) -> CoordResult<Permit> {
        self.transact("issue_permit", Scope::attempt(attempt_id), |txn| {
            txn.sweep_attempt(attempt_id)?;
            txn.state().attempts.check_open(attempt_id)?;
            let seal = self.verified_seal(txn.state(), attempt_id)?;

            let ttl = request.ttl_minutes.unwrap_or(self.config.permit_ttl_minutes);
            if ttl == 0 || ttl > self.config.max_permit_ttl_minutes {
                return Err(Violation::invalid(
                    "ttl_minutes",
                    format!(
                        "{ttl} is outside 1..={}",
                        self.config.max_permit_ttl_minutes
                    ),
                )
                .into());
            }
            if request.target.trim().is_empty() {
                return Err(Violation::invalid("target", "must not be empty").into());
            }

            let body = PermitBody {
                seal_hash: seal.plan_hash,
                attempt_id,
                action: request.action,
                target: request.target,
                constraints: request.constraints,
                issued_at: txn.now,
                expires_at: txn.now.saturating_add(u64::from(ttl) * MS_PER_MINUTE),
                serial: txn.state().permits.next_serial(),
            };
            let permit = Permit::issue(body, self.config.seal_strength, self.signer.as_ref())?;
            txn.commit(JournalRecord::PermitIssued(permit.clone()))?;
            log::info!(
                "{attempt_id} issued permit {} for {} {}",
                permit.id,
                permit.body.action.as_str(),
                permit.body.target
            );
            Ok(permit)
        })
    }

    /// Check an attempted side effect against the permit it presents. A granted permit is
    /// consumed; a denial is recorded as an unpermitted attempt before it is returned.
    pub fn authorize_action(
        &self,
        attempt_id: AttemptId,
        request: ActionRequest,
    ) -> CoordResult<Permit> {
        self.transact("authorize_action", Scope::attempt(attempt_id), |txn| {
            txn.sweep_attempt(attempt_id)?;
            let attempt = txn.state().attempts.check_exists(attempt_id)?;
            let active_seal = if attempt.is_open() {
                txn.state()
                    .seals
                    .active_for(attempt_id)
                    .map(|seal| seal.plan_hash)
            } else {
                None
            };
            let trusted_key = self.public_key_hex();
            let ctx = AuthorizationContext {
                active_seal,
                now: txn.now,
                strength: self.config.seal_strength,
                trusted_key: trusted_key.as_deref(),
            };
            let verdict = txn
                .state()
                .permits
                .authorize(&request, &ctx)
                .cloned()
                .and_then(|permit| {
                    if permit.body.attempt_id == attempt_id {
                        Ok(permit)
                    } else {
                        Err(PermitDenial::NoPermit {
                            reason: format!("permit was issued to {}", permit.body.attempt_id),
                        })
                    }
                });
            match verdict {
                Ok(permit) => {
                    txn.commit(JournalRecord::PermitConsumed(PermitConsumedRecord {
                        attempt_id,
                        permit_id: permit.id,
                        consumed_at: txn.now,
                    }))?;
                    log::debug!("{attempt_id} consumed permit {}", permit.id);
                    Ok(permit)
                }
                Err(denial) => {
                    log::warn!(
                        "{attempt_id} denied {} {}: {} ({denial})",
                        request.action.as_str(),
                        request.target,
                        denial.code()
                    );
                    txn.commit(JournalRecord::ActionDenied(UnpermittedAttempt {
                        attempt_id,
                        seal_hash: active_seal,
                        permit_id: request.permit.as_ref().map(|permit| permit.id),
                        action: request.action,
                        target: request.target.clone(),
                        code: denial.code().to_string(),
                        detail: denial.to_string(),
                        attempted_at: txn.now,
                    }))?;
                    Err(Violation::Permit(denial).into())
                }
            }
        })
    }

    /// Turn an executor's report into a sealed, hashed and chained evidence bundle.
    ///
    /// Fatal seal divergences refuse the run. Otherwise the bundle is stored, verified and
    /// recorded as `bundle` evidence on the attempt whatever the verdict; completion decides
    /// later whether that verdict is good enough. Finalizing spends the active seal.
    pub fn finalize_run(
        &self,
        attempt_id: AttemptId,
        report: RunReport,
    ) -> CoordResult<FinalizedRun> {
        self.transact("finalize_run", Scope::attempt(attempt_id), |txn| {
            if let Some(run_id) = &report.run_id {
                if let Some(entry) = txn.state().runs.by_run_id(run_id) {
                    if entry.attempt_id != attempt_id {
                        return Err(IntegrityViolation::immutable(format!("run {run_id}")).into());
                    }
                    return self.finalized_already(txn.state(), entry);
                }
            }
            txn.sweep_attempt(attempt_id)?;
            txn.state().attempts.check_open(attempt_id)?;
            let seal = self.verified_seal(txn.state(), attempt_id)?;
            validate_report(&report)?;

            let executed_gates = report
                .gates
                .iter()
                .filter(|gate| gate.status != GateStatus::Skipped)
                .map(|gate| gate.gate_id.as_str())
                .collect();
            let violations = verify_execution(
                &seal,
                &ExecutionSummary {
                    plan_hash: report.plan_hash,
                    executed_gates,
                    changed_paths: &report.changed_paths,
                    policy_versions: report.policy_versions.as_ref(),
                },
            )
            .map_err(|err| Violation::invalid("scope", err.to_string()))?;
            if let Some(fatal) = violations.into_iter().find(SealViolation::is_fatal) {
                return Err(Violation::Seal(fatal).into());
            }

            let scope: Vec<&String> = seal.plan.scope.iter().collect();
            let recon = reconcile(&scope, &report.changed_paths)
                .map_err(|err| Violation::invalid("scope", err.to_string()))?;
            let unpermitted: Vec<UnpermittedAttempt> = txn
                .state()
                .permits
                .unpermitted_for(attempt_id)
                .into_iter()
                .cloned()
                .collect();
            let prev_run_hash = txn.state().runs.head(&self.config.workspace_id);
            let run_id = report
                .run_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            let mut builder = BundleBuilder::new(
                run_id.as_str(),
                self.config.workspace_id.as_str(),
                txn.now,
                &seal,
                report.source_snapshot.as_str(),
            );
            for gate in report.gates {
                builder = builder.gate(gate);
            }
            for artifact in report.artifacts {
                builder = builder.artifact(artifact.path, artifact.bytes);
            }
            let bundle = builder
                .changed_paths(report.changed_paths)
                .reconciliation(&recon)
                .unpermitted(unpermitted)
                .budget(report.budget)
                .prev_run_hash(prev_run_hash)
                .finish(self.signer.as_ref())?;
            let run_hash = bundle.manifest.compute_run_hash()?;

            for bytes in bundle.files.values() {
                self.store.put_blob(bytes)?;
            }
            let manifest_hash = self.store.put_node(&bundle.manifest)?;
            let bundle_dir = match &self.config.bundle_root {
                Some(root) => {
                    let dir = root.join(&run_id);
                    write_bundle(&dir, &bundle)?;
                    Some(dir)
                }
                None => None,
            };

            let artifacts = StoreArtifacts::new(self.store.as_ref(), &bundle.manifest.artifacts);
            let verdict = verify_manifest(&bundle.manifest, &artifacts, &self.verify_policy());

            let name = format!("run:{run_id}");
            if let Recorded::Existing(_) =
                txn.state()
                    .records
                    .check_evidence(attempt_id, &name, &manifest_hash)?
            {
                return Err(IntegrityViolation::immutable(format!("run {run_id}")).into());
            }
            let evidence = EvidenceRecord {
                id: txn.state().ids.next_evidence(),
                attempt_id,
                name,
                kind: ArtifactKind::Bundle,
                hash: manifest_hash,
                size: to_canonical_json(&bundle.manifest)?.len() as u64,
                media_type: Some("application/json".into()),
                recorded_at: txn.now,
            };
            let evidence_id = evidence.id;
            txn.commit(JournalRecord::RunFinalized(RunFinalizedRecord {
                attempt_id,
                run_id: run_id.clone(),
                run_hash,
                manifest_hash,
                prev_run_hash,
                workspace_id: self.config.workspace_id.clone(),
                seal_hash: seal.plan_hash,
                verdict: verdict.outcome,
                evidence,
                finalized_at: txn.now,
            }))?;
            if verdict.outcome.is_pass() {
                log::info!("{attempt_id} finalized run {run_id} as {run_hash}");
            } else {
                log::warn!(
                    "{attempt_id} finalized run {run_id} as {run_hash} with verdict {}",
                    verdict.outcome.code()
                );
            }

            Ok(FinalizedRun {
                run_hash,
                manifest_hash,
                manifest: bundle.manifest,
                verdict,
                evidence_id,
                bundle_dir,
            })
        })
    }

    /// The attempt's active seal, re-checked before it is trusted.
    fn verified_seal(&self, state: &KernelState, attempt_id: AttemptId) -> CoordResult<PlanSeal> {
        let seal = state
            .seals
            .active_for(attempt_id)
            .cloned()
            .ok_or_else(|| Violation::missing(vec![Unmet::PlanSeal { attempt_id }]))?;
        let trusted_key = self.public_key_hex();
        seal.verify_integrity(self.config.seal_strength, trusted_key.as_deref())
            .map_err(Violation::Seal)?;
        Ok(seal)
    }

    /// Re-submitting a report with a known run id returns the recorded run.
    fn finalized_already(
        &self,
        state: &KernelState,
        entry: &RunEntry,
    ) -> CoordResult<FinalizedRun> {
        let manifest: RunManifest = self.store.get_node(entry.manifest_hash)?;
        let artifacts = StoreArtifacts::new(self.store.as_ref(), &manifest.artifacts);
        let verdict = verify_manifest(&manifest, &artifacts, &self.verify_policy());
        let name = format!("run:{}", entry.run_id);
        let evidence_id = state
            .records
            .evidence_for(entry.attempt_id)
            .into_iter()
            .find(|evidence| evidence.name == name)
            .map(|evidence| evidence.id)
            .ok_or_else(|| {
                Violation::missing(vec![Unmet::Artifact {
                    hash: entry.manifest_hash,
                }])
            })?;
        let bundle_dir = self
            .config
            .bundle_root
            .as_ref()
            .map(|root| root.join(&entry.run_id))
            .filter(|dir| dir.is_dir());
        Ok(FinalizedRun {
            run_hash: entry.run_hash,
            manifest_hash: entry.manifest_hash,
            manifest,
            verdict,
            evidence_id,
            bundle_dir,
        })
    }
}

fn validate_report(report: &RunReport) -> CoordResult<()> {
    if report.source_snapshot.trim().is_empty() {
        return Err(Violation::invalid("source_snapshot", "must not be empty").into());
    }
    if let Some(run_id) = &report.run_id {
        let valid = !run_id.is_empty()
            && !run_id.starts_with('.')
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(
                Violation::invalid("run_id", format!("'{run_id}' is not a valid run id")).into(),
            );
        }
    }

    let mut gate_ids = BTreeSet::new();
    let mut files = BTreeSet::new();
    for gate in &report.gates {
        if gate.gate_id.trim().is_empty() {
            return Err(Violation::invalid("gates", "gate ids must not be empty").into());
        }
        if !gate_ids.insert(gate.gate_id.as_str()) {
            return Err(Violation::invalid(
                "gates",
                format!("gate '{}' is reported more than once", gate.gate_id),
            )
            .into());
        }
        for stream in ["stdout", "stderr"] {
            let path = log_path(&gate.gate_id, stream);
            if !files.insert(path.clone()) {
                return Err(Violation::invalid(
                    "gates",
                    format!("gate '{}' would overwrite {path}", gate.gate_id),
                )
                .into());
            }
        }
    }
    for artifact in &report.artifacts {
        check_artifact_path(&artifact.path)
            .map_err(|err| Violation::invalid("artifacts", err.to_string()))?;
        if !files.insert(artifact.path.clone()) {
            return Err(Violation::invalid(
                "artifacts",
                format!("'{}' is listed more than once", artifact.path),
            )
            .into());
        }
    }
    Ok(())
}
