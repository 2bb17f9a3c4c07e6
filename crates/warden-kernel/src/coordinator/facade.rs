//! The six public operations: claim, context, outcome, evidence, decision, release.

use super::*;

/// A granted (or re-confirmed) claim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimGrant {
    pub attempt: Attempt,
    pub contract_hash: Hash,
    pub contract: Contract,
    /// The claimant already held this attempt; nothing new was written.
    pub existing: bool,
}

/// Everything an agent needs to work an attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptContext {
    pub attempt: Attempt,
    pub work_item: WorkItem,
    pub contract: Contract,
    /// Direct dependencies with their current status.
    pub dependencies: Vec<WorkItem>,
    pub policy_versions: BTreeMap<String, String>,
    pub active_seal: Option<PlanSeal>,
    pub evidence: Vec<EvidenceRecord>,
    pub decisions: Vec<Decision>,
    pub outcomes: Vec<OutcomeRecord>,
    pub open_blockers: Vec<Blocker>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutcomeInput {
    #[serde(default)]
    pub summary: Option<String>,
    pub payload: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeAccepted {
    pub attempt_id: AttemptId,
    pub outcome_hash: Hash,
}

/// Evidence as submitted. Either the bytes (stored as a blob) or the hash of a blob already in
/// the store must be given; when both are, they must agree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceInput {
    pub name: String,
    /// Artifact type name, e.g. `test_result`, `diff`, `log`.
    pub kind: String,
    pub hash: Option<Hash>,
    #[serde(with = "serde_bytes")]
    pub bytes: Option<Vec<u8>>,
    pub media_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum ReleaseRequest {
    Done(CompletionClaim),
    Handoff { to_claimant: String, reason: String },
    Block { reason: String },
    Abandon {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ReleaseRequest {
    fn disposition(&self) -> Disposition {
        match self {
            ReleaseRequest::Done(_) => Disposition::Completed,
            ReleaseRequest::Handoff { .. } => Disposition::HandedOff,
            ReleaseRequest::Block { .. } => Disposition::Blocked,
            ReleaseRequest::Abandon { .. } => Disposition::Abandoned,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Completed { receipt: CompletionReceipt },
    HandedOff { previous: Attempt, successor: Attempt },
    Blocked { attempt: Attempt, blocker: Blocker },
    Abandoned { attempt: Attempt },
}

impl<S: Store + 'static> Coordinator<S> {
    /// Grant an exclusive, leased claim on a work item.
    pub fn claim_work(&self, work_id: &WorkId, claimant: &str) -> CoordResult<ClaimGrant> {
        self.transact("claim_work", Scope::work(work_id), |txn| {
            txn.sweep_work(work_id)?;
            let state = txn.state();
            match state
                .attempts
                .check_claim(&state.ledger, &state.records, work_id, claimant)?
            {
                ClaimCheck::Existing(attempt_id) => {
                    let attempt = state.attempts.check_exists(attempt_id)?.clone();
                    let contract = self.load_contract(attempt.contract_hash)?;
                    return Ok(ClaimGrant {
                        contract_hash: attempt.contract_hash,
                        attempt,
                        contract,
                        existing: true,
                    });
                }
                ClaimCheck::Grant => {}
            }
            let item = state.ledger.get(work_id).ok_or_else(|| Violation::WorkItemNotFound {
                work_id: work_id.clone(),
            })?;
            let contract =
                Contract::compile(&self.config.standards, item).map_err(Violation::missing)?;
            let contract_hash = self.store.put_node(&contract)?;
            let baseline = self.heads.head(&self.config.target_ref)?;
            let attempt_id = state.ids.next_attempt();
            txn.commit(JournalRecord::AttemptClaimed(AttemptClaimedRecord {
                attempt_id,
                work_id: work_id.clone(),
                claimant: claimant.to_string(),
                claimed_at: txn.now,
                lease_expires_at: self.lease_expiry(txn.now),
                contract_hash,
                baseline,
            }))?;
            log::info!("{claimant} claimed {work_id} as {attempt_id}");
            let attempt = txn.state().attempts.check_exists(attempt_id)?.clone();
            Ok(ClaimGrant {
                attempt,
                contract_hash,
                contract,
                existing: false,
            })
        })
    }

    /// Assemble the working context of an attempt. Read-only.
    pub fn get_context(&self, attempt_id: AttemptId) -> CoordResult<StateRead<AttemptContext>> {
        let inner = self.read()?;
        let state = &inner.state;
        let attempt = state
            .attempts
            .get(attempt_id)
            .ok_or_else(|| Violation::missing(vec![Unmet::AttemptNotFound { attempt_id }]))?;
        if attempt.is_open() && attempt.lease.is_expired_at(self.now()) {
            return Err(Violation::missing(vec![Unmet::LeaseExpired {
                attempt_id,
                expired_at: attempt.lease.expires_at,
            }])
            .into());
        }
        let work_item = state
            .ledger
            .get(&attempt.work_id)
            .ok_or_else(|| {
                Violation::missing(vec![Unmet::WorkItemNotFound {
                    work_id: attempt.work_id.clone(),
                }])
            })?
            .clone();
        let contract = self.load_contract(attempt.contract_hash)?;
        let dependencies = work_item
            .depends_on
            .iter()
            .filter_map(|dep| state.ledger.get(dep).cloned())
            .collect();
        let context = AttemptContext {
            attempt: attempt.clone(),
            policy_versions: contract.policy_versions.clone(),
            dependencies,
            active_seal: state.seals.active_for(attempt_id).cloned(),
            evidence: state
                .records
                .evidence_for(attempt_id)
                .into_iter()
                .cloned()
                .collect(),
            decisions: state
                .records
                .decisions_for(attempt_id)
                .into_iter()
                .cloned()
                .collect(),
            outcomes: state
                .records
                .outcomes_for(attempt_id)
                .into_iter()
                .cloned()
                .collect(),
            open_blockers: state
                .records
                .open_blockers(&work_item.id)
                .into_iter()
                .cloned()
                .collect(),
            work_item,
            contract,
        };
        Ok(StateRead {
            meta: self.read_meta(&inner),
            value: context,
        })
    }

    /// Record a progress outcome. Outcomes are not evidence and do not satisfy completion.
    pub fn put_outcome(
        &self,
        attempt_id: AttemptId,
        outcome: OutcomeInput,
    ) -> CoordResult<OutcomeAccepted> {
        self.transact("put_outcome", Scope::attempt(attempt_id), |txn| {
            txn.sweep_attempt(attempt_id)?;
            txn.state().attempts.check_open(attempt_id)?;
            let outcome_hash = self.store.put_node(&outcome.payload)?;
            let repeated = txn
                .state()
                .records
                .outcomes_for(attempt_id)
                .iter()
                .any(|existing| {
                    existing.outcome_hash == outcome_hash && existing.summary == outcome.summary
                });
            if !repeated {
                txn.commit(JournalRecord::OutcomeRecorded(OutcomeRecord {
                    attempt_id,
                    outcome_hash,
                    summary: outcome.summary.clone(),
                    recorded_at: txn.now,
                }))?;
            }
            Ok(OutcomeAccepted {
                attempt_id,
                outcome_hash,
            })
        })
    }

    /// Attach a typed, hashed artifact to an open attempt.
    pub fn record_evidence(
        &self,
        attempt_id: AttemptId,
        input: EvidenceInput,
    ) -> CoordResult<EvidenceId> {
        self.transact("record_evidence", Scope::attempt(attempt_id), |txn| {
            let kind: ArtifactKind = input.kind.parse()?;
            if input.name.trim().is_empty() {
                return Err(Violation::invalid("name", "must not be empty").into());
            }
            txn.sweep_attempt(attempt_id)?;
            txn.state().attempts.check_open(attempt_id)?;

            let (hash, size) = self.resolve_artifact(&input)?;
            match txn
                .state()
                .records
                .check_evidence(attempt_id, &input.name, &hash)?
            {
                Recorded::Existing(id) => return Ok(id),
                Recorded::New => {}
            }
            let id = txn.state().ids.next_evidence();
            txn.commit(JournalRecord::EvidenceRecorded(EvidenceRecord {
                id,
                attempt_id,
                name: input.name.clone(),
                kind,
                hash,
                size,
                media_type: input.media_type.clone(),
                recorded_at: txn.now,
            }))?;
            Ok(id)
        })
    }

    fn resolve_artifact(&self, input: &EvidenceInput) -> CoordResult<(Hash, u64)> {
        match (&input.bytes, input.hash) {
            (Some(bytes), claimed) => {
                let actual = Hash::of_bytes(bytes);
                if let Some(expected) = claimed {
                    if expected != actual {
                        return Err(IntegrityViolation::HashMismatch {
                            subject: format!("evidence '{}'", input.name),
                            expected,
                            actual,
                        }
                        .into());
                    }
                }
                self.store.put_blob(bytes)?;
                Ok((actual, bytes.len() as u64))
            }
            (None, Some(hash)) => match self.store.get_blob(hash) {
                Ok(bytes) => Ok((hash, bytes.len() as u64)),
                Err(StoreError::NotFound { .. }) => {
                    Err(Violation::missing(vec![Unmet::Artifact { hash }]).into())
                }
                Err(err) => Err(err.into()),
            },
            (None, None) => {
                Err(Violation::invalid("artifact", "either bytes or hash is required").into())
            }
        }
    }

    /// Append a decision. Allowed on any existing attempt, open or not.
    pub fn record_decision(
        &self,
        attempt_id: AttemptId,
        text: &str,
        rationale: &str,
    ) -> CoordResult<DecisionId> {
        self.transact("record_decision", Scope::attempt(attempt_id), |txn| {
            txn.state().attempts.check_exists(attempt_id)?;
            if text.trim().is_empty() {
                return Err(Violation::invalid("text", "must not be empty").into());
            }
            if let Recorded::Existing(id) =
                txn.state().records.check_decision(attempt_id, text, rationale)
            {
                return Ok(id);
            }
            let id = txn.state().ids.next_decision();
            txn.commit(JournalRecord::DecisionRecorded(Decision {
                id,
                attempt_id,
                text: text.to_string(),
                rationale: rationale.to_string(),
                recorded_at: txn.now,
            }))?;
            Ok(id)
        })
    }

    /// End an attempt with a terminal disposition. A lapsed lease does not prevent release; it is
    /// recorded as an expired release.
    pub fn release_work(
        &self,
        attempt_id: AttemptId,
        request: ReleaseRequest,
    ) -> CoordResult<ReleaseOutcome> {
        self.transact("release_work", Scope::attempt(attempt_id), |txn| {
            let attempt = txn.state().attempts.check_exists(attempt_id)?.clone();
            if !attempt.is_open() {
                return self.released_already(txn.state(), &attempt, &request);
            }
            let expired_release = attempt.lease.is_expired_at(txn.now);
            match request {
                ReleaseRequest::Done(claim) => {
                    self.complete(txn, &attempt, &claim, expired_release)
                }
                ReleaseRequest::Handoff {
                    to_claimant,
                    reason,
                } => {
                    txn.state()
                        .attempts
                        .check_handoff(&attempt, &to_claimant, &reason)?;
                    let successor_id = txn.state().ids.next_attempt();
                    txn.commit(JournalRecord::AttemptHandedOff(AttemptHandedOffRecord {
                        attempt_id,
                        successor_id,
                        to_claimant: to_claimant.clone(),
                        reason,
                        handed_off_at: txn.now,
                        lease_expires_at: self.lease_expiry(txn.now),
                        expired_release,
                    }))?;
                    log::info!("{attempt_id} handed off to {to_claimant} as {successor_id}");
                    let state = txn.state();
                    Ok(ReleaseOutcome::HandedOff {
                        previous: state.attempts.check_exists(attempt_id)?.clone(),
                        successor: state.attempts.check_exists(successor_id)?.clone(),
                    })
                }
                ReleaseRequest::Block { reason } => {
                    if reason.trim().is_empty() {
                        return Err(Violation::missing(vec![Unmet::BlockerReason]).into());
                    }
                    let blocker = Blocker {
                        id: txn.state().ids.next_blocker(),
                        attempt_id,
                        work_id: attempt.work_id.clone(),
                        reason,
                        raised_at: txn.now,
                        resolution: None,
                    };
                    txn.commit(JournalRecord::AttemptBlocked(AttemptBlockedRecord {
                        attempt_id,
                        blocker: blocker.clone(),
                        expired_release,
                    }))?;
                    log::info!("{attempt_id} blocked by {}", blocker.id);
                    Ok(ReleaseOutcome::Blocked {
                        attempt: txn.state().attempts.check_exists(attempt_id)?.clone(),
                        blocker,
                    })
                }
                ReleaseRequest::Abandon { reason } => {
                    txn.commit(JournalRecord::AttemptAbandoned(AttemptAbandonedRecord {
                        attempt_id,
                        reason,
                        abandoned_at: txn.now,
                        expired_release,
                    }))?;
                    log::info!("{attempt_id} abandoned");
                    Ok(ReleaseOutcome::Abandoned {
                        attempt: txn.state().attempts.check_exists(attempt_id)?.clone(),
                    })
                }
            }
        })
    }

    fn complete(
        &self,
        txn: &mut Txn<'_>,
        attempt: &Attempt,
        claim: &CompletionClaim,
        expired_release: bool,
    ) -> CoordResult<ReleaseOutcome> {
        let state = txn.state();
        state.attempts.check_complete(&state.records, attempt.id)?;

        let contract = self.load_contract(attempt.contract_hash)?;
        let recorded: BTreeSet<ArtifactKind> = state
            .records
            .evidence_for(attempt.id)
            .iter()
            .map(|evidence| evidence.kind)
            .collect();
        let missing: Vec<Unmet> = contract
            .required_evidence
            .iter()
            .filter(|kind| !recorded.contains(kind))
            .map(|kind| Unmet::Evidence { kind: *kind })
            .collect();
        if !missing.is_empty() {
            return Err(Violation::missing(missing).into());
        }

        let entry = self.bound_run(state, attempt, claim);
        let manifest = match entry {
            Some(entry) => match self.store.get_node::<RunManifest>(entry.manifest_hash) {
                Ok(manifest) => Some(manifest),
                Err(StoreError::NotFound { .. }) => None,
                Err(err) => return Err(err.into()),
            },
            None => None,
        };
        let empty = BTreeMap::new();
        let artifacts = StoreArtifacts::new(
            self.store.as_ref(),
            manifest.as_ref().map(|m| &m.artifacts).unwrap_or(&empty),
        );
        let head = self.heads.head(&self.config.target_ref)?;
        let verify_policy = self.verify_policy();
        let exceptions = state.records.exceptions_for(attempt.id);
        let receipt = bind(&BindingInput {
            attempt_id: attempt.id,
            work_id: &attempt.work_id,
            claim,
            exceptions: &exceptions,
            manifest: manifest.as_ref(),
            artifacts: &artifacts,
            verify_policy: &verify_policy,
            contract_gates: &contract.required_gates,
            target_ref: &self.config.target_ref,
            head,
            trusted_attesters: &self.config.trusted_attesters,
            now: txn.now,
        })
        .map_err(Violation::Completion)?;

        let receipt_hash = self.store.put_node(&receipt)?;
        txn.commit(JournalRecord::AttemptCompleted(AttemptCompletedRecord {
            attempt_id: attempt.id,
            receipt_hash,
            receipt: receipt.clone(),
            expired_release,
        }))?;
        log::info!(
            "{} completed {} bound to run {}",
            attempt.id,
            attempt.work_id,
            receipt.run_hash
        );
        Ok(ReleaseOutcome::Completed { receipt })
    }

    /// The run a completion binds to: the one named in the claim, else the latest run of the
    /// attempt, else the latest run of the attempts it was handed off from. Runs produced by
    /// other claimants of the same work item are never bound.
    fn bound_run<'s>(
        &self,
        state: &'s KernelState,
        attempt: &Attempt,
        claim: &CompletionClaim,
    ) -> Option<&'s RunEntry> {
        let lineage = handoff_lineage(state, attempt);
        match claim.run_hash {
            Some(run_hash) => state
                .runs
                .get(&run_hash)
                .filter(|entry| lineage.contains(&entry.attempt_id)),
            None => lineage
                .iter()
                .find_map(|id| state.attempts.get(*id).and_then(Attempt::latest_run))
                .and_then(|run_hash| state.runs.get(&run_hash)),
        }
    }

    /// Resubmitting the release that closed an attempt returns what was recorded.
    fn released_already(
        &self,
        state: &KernelState,
        attempt: &Attempt,
        request: &ReleaseRequest,
    ) -> CoordResult<ReleaseOutcome> {
        let not_open = || -> CoordError {
            Violation::AttemptNotOpen {
                attempt_id: attempt.id,
                disposition: attempt.disposition,
            }
            .into()
        };
        if request.disposition() != attempt.disposition {
            return Err(not_open());
        }
        match attempt.disposition {
            Disposition::Completed => state
                .receipts
                .get(&attempt.id)
                .map(|receipt| ReleaseOutcome::Completed {
                    receipt: receipt.clone(),
                })
                .ok_or_else(not_open),
            Disposition::HandedOff => attempt
                .successor
                .and_then(|id| state.attempts.get(id))
                .map(|successor| ReleaseOutcome::HandedOff {
                    previous: attempt.clone(),
                    successor: successor.clone(),
                })
                .ok_or_else(not_open),
            Disposition::Blocked => attempt
                .blocker
                .and_then(|id| state.records.blocker(id))
                .map(|blocker| ReleaseOutcome::Blocked {
                    attempt: attempt.clone(),
                    blocker: blocker.clone(),
                })
                .ok_or_else(not_open),
            Disposition::Abandoned => Ok(ReleaseOutcome::Abandoned {
                attempt: attempt.clone(),
            }),
            Disposition::Open => Err(not_open()),
        }
    }
}

/// The attempt followed by its handoff predecessors, newest first.
fn handoff_lineage(state: &KernelState, attempt: &Attempt) -> Vec<AttemptId> {
    let mut lineage = vec![attempt.id];
    let mut next = attempt.predecessor;
    while let Some(id) = next {
        if lineage.contains(&id) {
            break;
        }
        lineage.push(id);
        next = state.attempts.get(id).and_then(|prev| prev.predecessor);
    }
    lineage
}
